//! Snapshot artifact claim provisioning.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::interfaces::{PlatformError, VolumeDirectory};
use crate::APP_NAME;

use super::quantity::{parse_quantity, QuantityError};

/// Name of the claim holding snapshot artifacts in each namespace.
pub const SNAPSHOT_PVC_NAME: &str = "etcd-snapshots";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid snapshot PVC size {size:?}: {source}")]
    InvalidSize {
        size: String,
        #[source]
        source: QuantityError,
    },

    #[error("failed to provision snapshot PVC: {0}")]
    Platform(#[from] PlatformError),
}

/// Ensures the snapshot artifact claim exists.
pub struct SnapshotPvcProvisioner {
    volumes: Arc<dyn VolumeDirectory>,
    size: String,
    storage_class: Option<String>,
}

impl SnapshotPvcProvisioner {
    pub fn new(volumes: Arc<dyn VolumeDirectory>, storage: &StorageConfig) -> Self {
        Self {
            volumes,
            size: storage.pvc_size.clone(),
            storage_class: Some(storage.storage_class.clone()).filter(|s| !s.is_empty()),
        }
    }

    /// Return the snapshot claim name in `namespace`, creating the claim if
    /// absent. Losing a creation race to another caller counts as success.
    pub async fn ensure_snapshot_pvc(&self, namespace: &str) -> Result<String, ProvisionError> {
        if self
            .volumes
            .get_claim(namespace, SNAPSHOT_PVC_NAME)
            .await?
            .is_some()
        {
            debug!(namespace = %namespace, "Snapshot PVC already exists");
            return Ok(SNAPSHOT_PVC_NAME.to_string());
        }

        parse_quantity(&self.size).map_err(|source| ProvisionError::InvalidSize {
            size: self.size.clone(),
            source,
        })?;

        let claim = self.claim_spec(namespace);
        match self.volumes.create_claim(namespace, &claim).await {
            Ok(_) => {
                info!(
                    namespace = %namespace,
                    size = %self.size,
                    storage_class = ?self.storage_class,
                    "Created snapshot PVC"
                );
            }
            Err(e) if e.is_already_exists() => {
                debug!(namespace = %namespace, "Snapshot PVC created concurrently");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(SNAPSHOT_PVC_NAME.to_string())
    }

    fn claim_spec(&self, namespace: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(SNAPSHOT_PVC_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), APP_NAME.to_string())])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
