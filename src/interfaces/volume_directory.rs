//! VolumeDirectory trait definition.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use super::Result;

/// Read access to claims and pods, plus claim creation for snapshot storage.
#[async_trait]
pub trait VolumeDirectory: Send + Sync {
    /// Fetch a claim by namespace and name.
    ///
    /// Returns `None` if the claim does not exist.
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Create a claim.
    ///
    /// Fails with `PlatformError::AlreadyExists` when a claim with the same
    /// name is already present.
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// List pods in `namespace` matching a label selector (`key=value`).
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
}
