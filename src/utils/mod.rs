//! Process-level helpers shared by the binary and the library.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod readiness;
pub mod retry;
