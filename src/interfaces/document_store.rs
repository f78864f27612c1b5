//! DocumentStore trait definition.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;

use super::Result;

/// Namespace-scoped documents with a string-to-string field map.
///
/// The document is the unit of read-modify-write. `replace_document` is a
/// compare-and-swap: the document's `metadata.resourceVersion` must match the
/// stored version, otherwise `PlatformError::Conflict` is returned and the
/// caller is expected to re-read and retry.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns `None` if the document does not exist.
    async fn get_document(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Fails with `PlatformError::AlreadyExists` if the document exists.
    async fn create_document(&self, namespace: &str, document: &ConfigMap) -> Result<ConfigMap>;

    /// Fails with `PlatformError::Conflict` on a stale `resourceVersion`.
    async fn replace_document(&self, namespace: &str, document: &ConfigMap) -> Result<ConfigMap>;
}
