//! Label-based etcd cluster discovery.
//!
//! A data claim names its cluster through a label; the etcd pods carry the
//! same label. Endpoints are derived from pod DNS names, one per pod.
//!
//! ```yaml
//! # PersistentVolumeClaim
//! labels:
//!   etcd.io/cluster: cluster-x
//!
//! # etcd pods
//! labels:
//!   etcd.io/cluster: cluster-x
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::interfaces::{PlatformError, VolumeDirectory};

use super::ClusterInfo;

/// Pod count at which a cluster can tolerate one member failure.
const QUORUM_POD_COUNT: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("volume {namespace}/{name} not found")]
    VolumeNotFound { namespace: String, name: String },

    #[error("volume {namespace}/{name} has no {label} label")]
    MissingLabel {
        namespace: String,
        name: String,
        label: String,
    },

    #[error("no pods found for etcd cluster {cluster} in namespace {namespace}")]
    NoPods { namespace: String, cluster: String },

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Resolves the etcd cluster backing a volume claim.
pub struct ClusterDiscovery {
    volumes: Arc<dyn VolumeDirectory>,
    label_key: String,
    client_port: u16,
    scheme: &'static str,
}

impl ClusterDiscovery {
    pub fn new(volumes: Arc<dyn VolumeDirectory>, cluster: &ClusterConfig, tls_enabled: bool) -> Self {
        Self {
            volumes,
            label_key: cluster.label_key.clone(),
            client_port: cluster.client_port,
            scheme: if tls_enabled { "https" } else { "http" },
        }
    }

    /// Find the cluster named by the claim's label and list its endpoints.
    ///
    /// Endpoints are not probed for reachability.
    pub async fn discover_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterInfo, DiscoveryError> {
        let claim = self
            .volumes
            .get_claim(namespace, name)
            .await?
            .ok_or_else(|| DiscoveryError::VolumeNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        let cluster = claim
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.label_key))
            .cloned()
            .ok_or_else(|| DiscoveryError::MissingLabel {
                namespace: namespace.to_string(),
                name: name.to_string(),
                label: self.label_key.clone(),
            })?;

        let selector = format!("{}={}", self.label_key, cluster);
        let mut pod_names: Vec<String> = self
            .volumes
            .list_pods(namespace, &selector)
            .await?
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect();

        if pod_names.is_empty() {
            return Err(DiscoveryError::NoPods {
                namespace: namespace.to_string(),
                cluster,
            });
        }
        pod_names.sort();

        let endpoints: Vec<String> = pod_names
            .iter()
            .map(|pod| self.endpoint_for(pod, namespace))
            .collect();
        debug!(cluster = %cluster, ?endpoints, "Resolved etcd endpoints");

        let info = ClusterInfo {
            name: cluster,
            namespace: namespace.to_string(),
            has_quorum: endpoints.len() >= QUORUM_POD_COUNT,
            endpoints,
        };
        info!(
            cluster = %info.name,
            namespace = %info.namespace,
            members = info.endpoints.len(),
            has_quorum = info.has_quorum,
            "Discovered etcd cluster"
        );
        Ok(info)
    }

    fn endpoint_for(&self, pod: &str, namespace: &str) -> String {
        format!(
            "{}://{}.{}.svc.cluster.local:{}",
            self.scheme, pod, namespace, self.client_port
        )
    }
}
