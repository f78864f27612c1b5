//! Group snapshot orchestration.
//!
//! `GroupSnapshotOrchestrator` drives create, get and delete across the
//! discovery, health, storage and job layers. Errors surface as one of four
//! caller-visible kinds and convert directly into `tonic::Status`, so a CSI
//! transport can return them unchanged.

mod group_snapshot;
pub mod volume;

#[cfg(test)]
mod tests;

pub use group_snapshot::GroupSnapshotOrchestrator;
pub use volume::VolumeReference;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tonic::{Code, Status};

/// Caller-visible orchestration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl SnapshotError {
    pub fn code(&self) -> Code {
        match self {
            SnapshotError::InvalidArgument(_) => Code::InvalidArgument,
            SnapshotError::FailedPrecondition(_) => Code::FailedPrecondition,
            SnapshotError::NotFound(_) => Code::NotFound,
            SnapshotError::Internal(_) => Code::Internal,
        }
    }
}

impl From<SnapshotError> for Status {
    fn from(err: SnapshotError) -> Self {
        let code = err.code();
        Status::new(code, err.to_string())
    }
}

/// One snapshot artifact inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
    /// Zero when the size was not reported.
    pub size_bytes: i64,
}

/// Result of create and get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub group_snapshot_id: String,
    pub snapshots: Vec<Snapshot>,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}
