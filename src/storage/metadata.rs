//! ConfigMap-backed snapshot metadata.
//!
//! Two documents live in the metadata namespace, one per key space. Each
//! key is a snapshot or group id and each value a JSON record. Writers
//! race on a single document, so every update is a compare-and-swap on
//! `resourceVersion`, retried from a fresh read when another writer got
//! there first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use backon::Retryable;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interfaces::{DocumentStore, PlatformError};
use crate::utils::retry::{is_write_race, metadata_backoff};
use crate::APP_NAME;

/// Which document a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpace {
    Snapshot,
    Group,
}

impl KeySpace {
    pub fn document_name(self) -> &'static str {
        match self {
            KeySpace::Snapshot => "etcd-snapshot-metadata",
            KeySpace::Group => "etcd-group-snapshot-metadata",
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpace::Snapshot => write!(f, "snapshot"),
            KeySpace::Group => write!(f, "group snapshot"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("{space} metadata {id} not found")]
    NotFound { space: KeySpace, id: String },

    #[error("{space} metadata {id} is not a valid record: {source}")]
    Decode {
        space: KeySpace,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode metadata: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("metadata store error: {0}")]
    Platform(#[from] PlatformError),
}

impl MetadataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound { .. })
    }
}

/// Record for one snapshot artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub cluster_name: String,
    pub creation_time: DateTime<Utc>,
    /// Artifact size in bytes, zero when unknown.
    pub size: i64,
    pub checksum: String,
    pub ready_to_use: bool,
    /// Claim holding the artifact.
    pub pvc_name: String,
    pub namespace: String,
}

/// Record for one group snapshot and the artifact it maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshotMetadata {
    pub group_snapshot_id: String,
    pub snapshot_id: String,
    pub source_volume_ids: Vec<String>,
    pub cluster_name: String,
    pub snapshot_pvc_name: String,
    pub snapshot_pvc_namespace: String,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}

/// Keyed JSON records in per-key-space ConfigMaps.
pub struct MetadataStore {
    documents: Arc<dyn DocumentStore>,
    namespace: String,
}

impl MetadataStore {
    pub fn new(documents: Arc<dyn DocumentStore>, namespace: impl Into<String>) -> Self {
        Self {
            documents,
            namespace: namespace.into(),
        }
    }

    /// Insert or overwrite the record under `id`.
    pub async fn store(&self, space: KeySpace, id: &str, value: &str) -> Result<(), MetadataError> {
        (|| async { self.try_store(space, id, value).await })
            .retry(metadata_backoff())
            .when(is_write_race)
            .notify(|e: &PlatformError, delay| {
                debug!(space = %space, id = %id, error = %e, ?delay, "Metadata write raced, retrying");
            })
            .await?;
        Ok(())
    }

    pub async fn retrieve(&self, space: KeySpace, id: &str) -> Result<String, MetadataError> {
        let not_found = || MetadataError::NotFound {
            space,
            id: id.to_string(),
        };
        let document = self
            .documents
            .get_document(&self.namespace, space.document_name())
            .await?
            .ok_or_else(not_found)?;

        document
            .data
            .and_then(|mut data| data.remove(id))
            .ok_or_else(not_found)
    }

    /// Remove the record under `id`. Absent records are not an error.
    pub async fn delete(&self, space: KeySpace, id: &str) -> Result<(), MetadataError> {
        (|| async { self.try_delete(space, id).await })
            .retry(metadata_backoff())
            .when(is_write_race)
            .notify(|e: &PlatformError, delay| {
                debug!(space = %space, id = %id, error = %e, ?delay, "Metadata delete raced, retrying");
            })
            .await?;
        Ok(())
    }

    async fn try_store(&self, space: KeySpace, id: &str, value: &str) -> Result<(), PlatformError> {
        let name = space.document_name();
        match self.documents.get_document(&self.namespace, name).await? {
            None => {
                let document = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        labels: Some(BTreeMap::from([(
                            "app".to_string(),
                            APP_NAME.to_string(),
                        )])),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(id.to_string(), value.to_string())])),
                    ..Default::default()
                };
                self.documents
                    .create_document(&self.namespace, &document)
                    .await?;
            }
            Some(mut document) => {
                document
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(id.to_string(), value.to_string());
                self.documents
                    .replace_document(&self.namespace, &document)
                    .await?;
            }
        }
        Ok(())
    }

    async fn try_delete(&self, space: KeySpace, id: &str) -> Result<(), PlatformError> {
        let Some(mut document) = self
            .documents
            .get_document(&self.namespace, space.document_name())
            .await?
        else {
            return Ok(());
        };

        let removed = document.data.as_mut().and_then(|data| data.remove(id));
        if removed.is_none() {
            return Ok(());
        }

        self.documents
            .replace_document(&self.namespace, &document)
            .await?;
        Ok(())
    }

    async fn store_record<T: Serialize>(
        &self,
        space: KeySpace,
        id: &str,
        record: &T,
    ) -> Result<(), MetadataError> {
        let value = serde_json::to_string(record).map_err(MetadataError::Encode)?;
        self.store(space, id, &value).await
    }

    async fn retrieve_record<T: DeserializeOwned>(
        &self,
        space: KeySpace,
        id: &str,
    ) -> Result<T, MetadataError> {
        let value = self.retrieve(space, id).await?;
        serde_json::from_str(&value).map_err(|source| {
            warn!(space = %space, id = %id, "Stored metadata record is malformed");
            MetadataError::Decode {
                space,
                id: id.to_string(),
                source,
            }
        })
    }

    pub async fn store_snapshot(&self, metadata: &SnapshotMetadata) -> Result<(), MetadataError> {
        self.store_record(KeySpace::Snapshot, &metadata.snapshot_id, metadata)
            .await
    }

    pub async fn retrieve_snapshot(&self, snapshot_id: &str) -> Result<SnapshotMetadata, MetadataError> {
        self.retrieve_record(KeySpace::Snapshot, snapshot_id).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), MetadataError> {
        self.delete(KeySpace::Snapshot, snapshot_id).await
    }

    pub async fn store_group(&self, metadata: &GroupSnapshotMetadata) -> Result<(), MetadataError> {
        self.store_record(KeySpace::Group, &metadata.group_snapshot_id, metadata)
            .await
    }

    pub async fn retrieve_group(
        &self,
        group_snapshot_id: &str,
    ) -> Result<GroupSnapshotMetadata, MetadataError> {
        self.retrieve_record(KeySpace::Group, group_snapshot_id).await
    }

    pub async fn delete_group(&self, group_snapshot_id: &str) -> Result<(), MetadataError> {
        self.delete(KeySpace::Group, group_snapshot_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;
    use futures::future::join_all;

    fn store_with(platform: &Arc<MockPlatform>) -> MetadataStore {
        MetadataStore::new(platform.clone(), "kube-system")
    }

    fn group(id: &str) -> GroupSnapshotMetadata {
        GroupSnapshotMetadata {
            group_snapshot_id: id.to_string(),
            snapshot_id: format!("{}-1700000000", id),
            source_volume_ids: vec!["db/data-0".to_string(), "db/data-1".to_string()],
            cluster_name: "cluster-x".to_string(),
            snapshot_pvc_name: "etcd-snapshots".to_string(),
            snapshot_pvc_namespace: "db".to_string(),
            creation_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            ready_to_use: true,
        }
    }

    #[tokio::test]
    async fn test_group_record_round_trip() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);
        let record = group("daily-1700000000");

        store.store_group(&record).await.unwrap();
        assert_eq!(store.retrieve_group("daily-1700000000").await.unwrap(), record);

        let document = platform
            .get_stored_document("kube-system", "etcd-group-snapshot-metadata")
            .await
            .unwrap();
        assert_eq!(
            document.metadata.labels.unwrap()["app"],
            "etcd-snapshot-driver".to_string()
        );
    }

    #[tokio::test]
    async fn test_key_spaces_are_separate_documents() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);

        store.store(KeySpace::Snapshot, "id", "{}").await.unwrap();
        let err = store.retrieve(KeySpace::Group, "id").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_then_retrieve_is_not_found() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);
        store.store_group(&group("g1")).await.unwrap();
        store.store_group(&group("g2")).await.unwrap();

        store.delete_group("g1").await.unwrap();

        assert!(store.retrieve_group("g1").await.unwrap_err().is_not_found());
        assert!(store.retrieve_group("g2").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_never_stored_succeeds() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);

        // Neither the document nor the key exists.
        store.delete(KeySpace::Snapshot, "missing").await.unwrap();

        store.store(KeySpace::Snapshot, "other", "{}").await.unwrap();
        store.delete(KeySpace::Snapshot, "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_store_retries_after_conflict() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);
        store.store(KeySpace::Snapshot, "a", "1").await.unwrap();

        platform.inject_conflicts(3).await;
        store.store(KeySpace::Snapshot, "b", "2").await.unwrap();

        assert_eq!(store.retrieve(KeySpace::Snapshot, "a").await.unwrap(), "1");
        assert_eq!(store.retrieve(KeySpace::Snapshot, "b").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_every_key() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);

        let writes = (0..4).map(|i| {
            let store = &store;
            async move {
                store
                    .store(KeySpace::Snapshot, &format!("snap-{}", i), &i.to_string())
                    .await
            }
        });
        for result in join_all(writes).await {
            result.unwrap();
        }

        // Every writer read the document before any of them wrote it.
        assert!(platform.lost_races().await >= 3);
        for i in 0..4 {
            let value = store
                .retrieve(KeySpace::Snapshot, &format!("snap-{}", i))
                .await
                .unwrap();
            assert_eq!(value, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_platform_failure_is_not_retried() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);
        platform.set_fail_documents(true).await;

        let err = store.store(KeySpace::Group, "g", "{}").await.unwrap_err();
        assert!(matches!(err, MetadataError::Platform(_)));
    }

    #[tokio::test]
    async fn test_malformed_record_is_decode_error() {
        let platform = Arc::new(MockPlatform::new());
        let store = store_with(&platform);
        store.store(KeySpace::Group, "g", "not json").await.unwrap();

        let err = store.retrieve_group("g").await.unwrap_err();
        assert!(matches!(err, MetadataError::Decode { .. }));
        assert!(!err.to_string().contains("not json"));
    }
}
