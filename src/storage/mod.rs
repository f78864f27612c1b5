//! Snapshot storage.
//!
//! - `pvc`: the shared claim that holds snapshot artifacts
//! - `metadata`: ConfigMap-backed snapshot and group records
//! - `quantity`: Kubernetes quantity parsing for claim sizes

pub mod metadata;
pub mod pvc;
pub mod quantity;

pub use metadata::{GroupSnapshotMetadata, KeySpace, MetadataError, MetadataStore, SnapshotMetadata};
pub use pvc::{ProvisionError, SnapshotPvcProvisioner, SNAPSHOT_PVC_NAME};
