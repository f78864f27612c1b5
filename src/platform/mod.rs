//! Platform collaborator implementations.
//!
//! - `KubePlatform`: Kubernetes API server via `kube`
//! - `MockPlatform`: In-memory implementation for testing

pub mod kube;
pub mod mock;

pub use self::kube::KubePlatform;
pub use self::mock::{JobBehavior, MockPlatform};
