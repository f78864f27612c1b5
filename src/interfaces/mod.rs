//! Abstract interfaces for the platform collaborators.
//!
//! These traits define the contracts for:
//! - Volume directory (claims and the pods that back them)
//! - Worker-unit platform (one-shot Jobs and their logs)
//! - Document store (ConfigMaps holding snapshot metadata)
//!
//! `platform::KubePlatform` implements all three against a live API server;
//! `platform::MockPlatform` implements them in memory for tests.

pub mod document_store;
pub mod job_platform;
pub mod volume_directory;

pub use document_store::DocumentStore;
pub use job_platform::JobPlatform;
pub use volume_directory::VolumeDirectory;

/// Errors returned by platform collaborators.
///
/// The classified variants let callers implement the idempotency rules
/// (tolerate `AlreadyExists` on create, `NotFound` on delete, retry on
/// `Conflict`) without inspecting API status codes themselves.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Invalid {kind}: {message}")]
    InvalidObject { kind: &'static str, message: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, PlatformError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PlatformError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;
