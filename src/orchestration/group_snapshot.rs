//! Create, get and delete for group snapshots.
//!
//! A group maps to exactly one artifact: every source volume must resolve
//! to the same etcd cluster, so one `etcdctl snapshot save` covers them all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::etcd::{ClusterDialer, ClusterDiscovery, ClusterInfo, HealthValidator};
use crate::interfaces::{DocumentStore, JobPlatform, VolumeDirectory};
use crate::job::{
    check_snapshot_name, generate_delete_job, generate_save_job, JobConfig, JobExecutor, JobResult,
};
use crate::storage::{
    GroupSnapshotMetadata, MetadataStore, SnapshotMetadata, SnapshotPvcProvisioner,
};

use super::volume::{validate_claim, VolumeReference};
use super::{GroupSnapshot, Snapshot, SnapshotError};

/// Drives group snapshot operations.
///
/// Holds no per-request state; every call runs independently and may run
/// concurrently with others.
pub struct GroupSnapshotOrchestrator {
    config: Arc<Config>,
    volumes: Arc<dyn VolumeDirectory>,
    discovery: ClusterDiscovery,
    health: HealthValidator,
    provisioner: SnapshotPvcProvisioner,
    executor: JobExecutor,
    metadata: MetadataStore,
    /// Flips to `true` on shutdown, abandoning in-flight job waits.
    shutdown: watch::Receiver<bool>,
}

impl GroupSnapshotOrchestrator {
    /// `config` is expected to have passed `Config::validate`.
    pub fn new(
        config: Arc<Config>,
        volumes: Arc<dyn VolumeDirectory>,
        jobs: Arc<dyn JobPlatform>,
        documents: Arc<dyn DocumentStore>,
        dialer: Arc<dyn ClusterDialer>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            discovery: ClusterDiscovery::new(volumes.clone(), &config.cluster, config.tls.enabled),
            health: HealthValidator::new(dialer, config.health.dial_timeout()),
            provisioner: SnapshotPvcProvisioner::new(volumes.clone(), &config.storage),
            executor: JobExecutor::new(
                jobs,
                config.snapshot.poll_interval(),
                config.snapshot.delete_timed_out_jobs,
            ),
            metadata: MetadataStore::new(documents, config.storage.metadata_namespace.clone()),
            volumes,
            config,
            shutdown,
        }
    }

    /// Snapshot the etcd cluster behind `source_volume_ids`.
    ///
    /// Every volume must be a bound, writable claim of the same healthy
    /// cluster. Nothing is created until all volumes pass.
    #[tracing::instrument(name = "group_snapshot.create", skip(self, source_volume_ids), fields(volumes = source_volume_ids.len()))]
    pub async fn create(
        &self,
        name: &str,
        source_volume_ids: &[String],
    ) -> Result<GroupSnapshot, SnapshotError> {
        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();

        let result = self.create_inner(name, source_volume_ids).await;

        #[cfg(feature = "otel")]
        record_operation("create", start, result.is_ok());

        result
    }

    async fn create_inner(
        &self,
        name: &str,
        source_volume_ids: &[String],
    ) -> Result<GroupSnapshot, SnapshotError> {
        if name.is_empty() {
            return Err(SnapshotError::InvalidArgument(
                "snapshot name required".to_string(),
            ));
        }
        check_snapshot_name(name).map_err(|e| {
            SnapshotError::InvalidArgument(format!("invalid snapshot name: {}", e))
        })?;
        if source_volume_ids.is_empty() {
            return Err(SnapshotError::InvalidArgument(
                "source_volume_ids required".to_string(),
            ));
        }

        let group_snapshot_id = format!("{}-{}", name, Utc::now().timestamp());
        info!(
            group_snapshot_id = %group_snapshot_id,
            volume_count = source_volume_ids.len(),
            "Creating group snapshot"
        );

        let references = source_volume_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                VolumeReference::parse(id).map_err(|e| {
                    SnapshotError::InvalidArgument(format!("invalid source_volume_id[{}]: {}", i, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (i, volume) in references.iter().enumerate() {
            validate_claim(self.volumes.as_ref(), volume)
                .await
                .map_err(|e| {
                    warn!(volume_index = i, volume = %volume, error = %e, "PVC validation failed");
                    SnapshotError::FailedPrecondition(format!(
                        "PVC validation failed for volume {}: {}",
                        i, e
                    ))
                })?;
        }

        let cluster = self.resolve_cluster(&references).await?;

        let first = &references[0];
        let pvc_name = self
            .provisioner
            .ensure_snapshot_pvc(&first.namespace)
            .await
            .map_err(|e| {
                error!(namespace = %first.namespace, error = %e, "Failed to prepare snapshot storage");
                SnapshotError::Internal(format!("failed to prepare snapshot storage: {}", e))
            })?;

        let snapshot_id = format!("{}-{}", group_snapshot_id, Utc::now().timestamp());
        let job_config = JobConfig::from_config(
            &self.config,
            snapshot_id.clone(),
            first.namespace.clone(),
            pvc_name.clone(),
            cluster.endpoints.clone(),
        );
        let job = generate_save_job(&job_config);

        let result = self
            .executor
            .execute_until(&job, self.config.snapshot.timeout(), self.shutdown.clone())
            .await
            .map_err(|e| {
                error!(snapshot_id = %snapshot_id, error = %e, "Snapshot job failed");
                SnapshotError::Internal(format!("snapshot creation failed: {}", e))
            })?;

        let creation_time = Utc::now();
        self.record_metadata(
            &group_snapshot_id,
            source_volume_ids,
            &cluster,
            &pvc_name,
            &first.namespace,
            &result,
            creation_time,
        )
        .await;

        info!(
            group_snapshot_id = %group_snapshot_id,
            snapshot_id = %snapshot_id,
            cluster = %cluster.name,
            duration = ?result.duration,
            "Group snapshot created"
        );

        Ok(GroupSnapshot {
            group_snapshot_id,
            snapshots: vec![Snapshot {
                snapshot_id,
                source_volume_id: source_volume_ids[0].clone(),
                creation_time,
                ready_to_use: true,
                size_bytes: result.snapshot_size.unwrap_or(0),
            }],
            creation_time,
            ready_to_use: true,
        })
    }

    /// Discover every volume's cluster, require one shared cluster, and
    /// check its health once per volume.
    async fn resolve_cluster(
        &self,
        references: &[VolumeReference],
    ) -> Result<ClusterInfo, SnapshotError> {
        let mut first: Option<ClusterInfo> = None;

        for (i, volume) in references.iter().enumerate() {
            let info = self
                .discovery
                .discover_cluster(&volume.namespace, &volume.name)
                .await
                .map_err(|e| {
                    error!(volume_index = i, volume = %volume, error = %e, "etcd discovery failed");
                    SnapshotError::Internal(format!(
                        "ETCD discovery failed for volume {}: {}",
                        i, e
                    ))
                })?;

            if let Some(expected) = &first {
                if info.name != expected.name {
                    error!(
                        volume_index = i,
                        expected_cluster = %expected.name,
                        got_cluster = %info.name,
                        "Cluster mismatch in group snapshot"
                    );
                    return Err(SnapshotError::FailedPrecondition(format!(
                        "all PVCs must belong to the same ETCD cluster: expected {}, got {}",
                        expected.name, info.name
                    )));
                }
                if !info.same_cluster(expected) {
                    error!(
                        volume_index = i,
                        expected_endpoints = ?expected.endpoints,
                        got_endpoints = ?info.endpoints,
                        "Cluster endpoints mismatch in group snapshot"
                    );
                    return Err(SnapshotError::FailedPrecondition(format!(
                        "all PVCs must belong to the same ETCD cluster {}: endpoints differ for volume {}",
                        expected.name, i
                    )));
                }
            }

            if let Err(e) = self.health.validate_health(&info.endpoints).await {
                warn!(volume_index = i, cluster = %info.name, error = %e, "etcd cluster unhealthy");

                #[cfg(feature = "otel")]
                {
                    use crate::utils::metrics::{self, CLUSTER_HEALTH_FAILURES};
                    CLUSTER_HEALTH_FAILURES.add(1, &[metrics::cluster_attr(&info.name)]);
                }

                return Err(SnapshotError::FailedPrecondition(format!(
                    "ETCD cluster health validation failed for volume {}: {}",
                    i, e
                )));
            }

            debug!(volume_index = i, cluster = %info.name, "etcd cluster discovered and validated");
            if first.is_none() {
                first = Some(info);
            }
        }

        first.ok_or_else(|| SnapshotError::InvalidArgument("source_volume_ids required".to_string()))
    }

    /// Best-effort: failures are logged, the artifact already exists.
    #[allow(clippy::too_many_arguments)]
    async fn record_metadata(
        &self,
        group_snapshot_id: &str,
        source_volume_ids: &[String],
        cluster: &ClusterInfo,
        pvc_name: &str,
        namespace: &str,
        result: &JobResult,
        creation_time: DateTime<Utc>,
    ) {
        let snapshot = SnapshotMetadata {
            snapshot_id: result.snapshot_id.clone(),
            source_volume_id: source_volume_ids[0].clone(),
            cluster_name: cluster.name.clone(),
            creation_time,
            size: result.snapshot_size.unwrap_or(0),
            checksum: result.checksum.clone().unwrap_or_default(),
            ready_to_use: true,
            pvc_name: pvc_name.to_string(),
            namespace: namespace.to_string(),
        };
        if let Err(e) = self.metadata.store_snapshot(&snapshot).await {
            warn!(snapshot_id = %snapshot.snapshot_id, error = %e, "Failed to store snapshot metadata");
        }

        let group = GroupSnapshotMetadata {
            group_snapshot_id: group_snapshot_id.to_string(),
            snapshot_id: result.snapshot_id.clone(),
            source_volume_ids: source_volume_ids.to_vec(),
            cluster_name: cluster.name.clone(),
            snapshot_pvc_name: pvc_name.to_string(),
            snapshot_pvc_namespace: namespace.to_string(),
            creation_time,
            ready_to_use: true,
        };
        if let Err(e) = self.metadata.store_group(&group).await {
            warn!(group_snapshot_id = %group_snapshot_id, error = %e, "Failed to store group snapshot metadata");
        }
    }

    /// Remove a group snapshot's artifact and metadata.
    ///
    /// Idempotent: unknown ids and failed cleanup steps still succeed.
    #[tracing::instrument(name = "group_snapshot.delete", skip(self))]
    pub async fn delete(&self, group_snapshot_id: &str) -> Result<(), SnapshotError> {
        if group_snapshot_id.is_empty() {
            return Err(SnapshotError::InvalidArgument(
                "group_snapshot_id required".to_string(),
            ));
        }

        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();

        let group = match self.metadata.retrieve_group(group_snapshot_id).await {
            Ok(group) => group,
            Err(e) if e.is_not_found() => {
                debug!(group_snapshot_id = %group_snapshot_id, "Group snapshot not found, nothing to delete");
                return Ok(());
            }
            Err(e) => {
                warn!(group_snapshot_id = %group_snapshot_id, error = %e, "Failed to read group snapshot metadata");
                return Ok(());
            }
        };

        info!(
            group_snapshot_id = %group_snapshot_id,
            snapshot_id = %group.snapshot_id,
            "Deleting group snapshot"
        );

        let job_config = JobConfig::from_config(
            &self.config,
            group.snapshot_id.clone(),
            group.snapshot_pvc_namespace.clone(),
            group.snapshot_pvc_name.clone(),
            Vec::new(),
        );
        let job = generate_delete_job(&job_config);
        if let Err(e) = self
            .executor
            .execute_until(&job, self.config.snapshot.cleanup_timeout(), self.shutdown.clone())
            .await
        {
            warn!(snapshot_id = %group.snapshot_id, error = %e, "Snapshot cleanup job failed");
        }

        if let Err(e) = self.metadata.delete_snapshot(&group.snapshot_id).await {
            warn!(snapshot_id = %group.snapshot_id, error = %e, "Failed to delete snapshot metadata");
        }
        if let Err(e) = self.metadata.delete_group(group_snapshot_id).await {
            warn!(group_snapshot_id = %group_snapshot_id, error = %e, "Failed to delete group snapshot metadata");
        }

        #[cfg(feature = "otel")]
        record_operation("delete", start, true);

        info!(group_snapshot_id = %group_snapshot_id, "Group snapshot deleted");
        Ok(())
    }

    /// Look up a group snapshot and its single artifact.
    #[tracing::instrument(name = "group_snapshot.get", skip(self))]
    pub async fn get(&self, group_snapshot_id: &str) -> Result<GroupSnapshot, SnapshotError> {
        if group_snapshot_id.is_empty() {
            return Err(SnapshotError::InvalidArgument(
                "group_snapshot_id required".to_string(),
            ));
        }

        let group = self
            .metadata
            .retrieve_group(group_snapshot_id)
            .await
            .map_err(|e| {
                debug!(group_snapshot_id = %group_snapshot_id, error = %e, "Group snapshot lookup failed");
                SnapshotError::NotFound(format!("group snapshot not found: {}", group_snapshot_id))
            })?;

        debug!(
            group_snapshot_id = %group_snapshot_id,
            snapshot_id = %group.snapshot_id,
            ready_to_use = group.ready_to_use,
            "Retrieved group snapshot metadata"
        );

        let (creation_time, size_bytes) = match self.metadata.retrieve_snapshot(&group.snapshot_id).await {
            Ok(snapshot) => (snapshot.creation_time, snapshot.size),
            Err(e) => {
                debug!(snapshot_id = %group.snapshot_id, error = %e, "Snapshot metadata unavailable");
                (group.creation_time, 0)
            }
        };

        Ok(GroupSnapshot {
            group_snapshot_id: group.group_snapshot_id,
            snapshots: vec![Snapshot {
                snapshot_id: group.snapshot_id,
                source_volume_id: group.source_volume_ids.first().cloned().unwrap_or_default(),
                creation_time,
                ready_to_use: group.ready_to_use,
                size_bytes,
            }],
            creation_time,
            ready_to_use: group.ready_to_use,
        })
    }
}

#[cfg(feature = "otel")]
fn record_operation(operation: &str, start: std::time::Instant, ok: bool) {
    use crate::utils::metrics::{self, OPERATION_DURATION, OPERATION_TOTAL};
    let outcome = if ok { "success" } else { "error" };
    let attrs = [metrics::operation_attr(operation), metrics::outcome_attr(outcome)];
    OPERATION_DURATION.record(start.elapsed().as_secs_f64(), &attrs);
    OPERATION_TOTAL.add(1, &attrs);
}
