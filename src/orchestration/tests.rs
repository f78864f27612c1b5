use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tonic::Code;

use super::*;
use crate::config::Config;
use crate::etcd::mock::MockClusterDialer;
use crate::platform::{JobBehavior, MockPlatform};
use crate::storage::{GroupSnapshotMetadata, MetadataStore};

const LABEL: &str = "etcd.io/cluster";

struct Fixture {
    platform: Arc<MockPlatform>,
    dialer: MockClusterDialer,
    shutdown: watch::Sender<bool>,
    orchestrator: GroupSnapshotOrchestrator,
}

async fn fixture() -> Fixture {
    let platform = Arc::new(MockPlatform::new());
    let dialer = MockClusterDialer::healthy_cluster(3);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let orchestrator = GroupSnapshotOrchestrator::new(
        Arc::new(Config::for_test()),
        platform.clone(),
        platform.clone(),
        platform.clone(),
        Arc::new(dialer.clone()),
        shutdown_rx,
    );
    Fixture {
        platform,
        dialer,
        shutdown,
        orchestrator,
    }
}

impl Fixture {
    async fn add_cluster(&self, namespace: &str, cluster: &str, pods: &[&str]) {
        for pod in pods {
            self.platform
                .add_pod(namespace, pod, &[(LABEL, cluster)])
                .await;
        }
    }

    async fn add_volume(&self, namespace: &str, name: &str, cluster: &str) {
        self.platform
            .add_claim(namespace, name, "Bound", &["ReadWriteOnce"], &[(LABEL, cluster)])
            .await;
    }

    fn metadata(&self) -> MetadataStore {
        MetadataStore::new(self.platform.clone(), "kube-system")
    }
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_snapshot_error_maps_to_status_code() {
    let cases = [
        (SnapshotError::InvalidArgument("a".into()), Code::InvalidArgument),
        (SnapshotError::FailedPrecondition("b".into()), Code::FailedPrecondition),
        (SnapshotError::NotFound("c".into()), Code::NotFound),
        (SnapshotError::Internal("d".into()), Code::Internal),
    ];
    for (err, code) in cases {
        let message = err.to_string();
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), code);
        assert_eq!(status.message(), message);
    }
}

#[tokio::test]
async fn test_create_two_volumes_same_cluster() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0", "etcd-1", "etcd-2"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    f.add_volume("db", "data-1", "cluster-x").await;

    let group = f
        .orchestrator
        .create("nightly", &ids(&["db/data-0", "db/data-1"]))
        .await
        .unwrap();

    assert!(group.group_snapshot_id.starts_with("nightly-"));
    assert_eq!(group.snapshots.len(), 1);
    assert_eq!(group.snapshots[0].source_volume_id, "db/data-0");
    assert!(group.snapshots[0].snapshot_id.starts_with(&group.group_snapshot_id));
    assert_eq!(f.platform.created_jobs().await.len(), 1);

    let stored = f
        .metadata()
        .retrieve_group(&group.group_snapshot_id)
        .await
        .unwrap();
    assert_eq!(stored.source_volume_ids, ids(&["db/data-0", "db/data-1"]));
    assert_eq!(stored.snapshot_pvc_name, "etcd-snapshots");
    assert_eq!(stored.snapshot_pvc_namespace, "db");
}

#[tokio::test]
async fn test_create_records_reported_size() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    f.platform
        .set_job_logs("{\"hash\":255,\"revision\":3,\"totalKey\":9,\"totalSize\":8192}")
        .await;

    let group = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap();
    assert_eq!(group.snapshots[0].size_bytes, 8192);

    let snapshot = f
        .metadata()
        .retrieve_snapshot(&group.snapshots[0].snapshot_id)
        .await
        .unwrap();
    assert_eq!(snapshot.size, 8192);
    assert_eq!(snapshot.checksum, "000000ff");
    assert_eq!(snapshot.cluster_name, "cluster-x");
}

#[tokio::test]
async fn test_create_rejects_bad_volume_id_with_index() {
    let f = fixture().await;
    let err = f
        .orchestrator
        .create("daily", &ids(&["db/data-0", "db/"]))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.to_string().starts_with("invalid source_volume_id[1]"));
}

#[tokio::test]
async fn test_create_rejects_unusable_name_before_side_effects() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0", "etcd-1", "etcd-2"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;

    for name in [
        "x;touch /snapshots/pwned;#",
        "Daily",
        "groupsnapshot-3f2a9c1e-8d4b-4b8e-9a51-0c6f2e7d1b44",
    ] {
        let err = f
            .orchestrator
            .create(name, &ids(&["db/data-0"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "{name}");
        assert!(err.to_string().starts_with("invalid snapshot name"), "{err}");
    }

    assert!(f.dialer.dials().is_empty());
    assert!(f.platform.get_stored_claim("db", "etcd-snapshots").await.is_none());
    assert!(f.platform.created_jobs().await.is_empty());
}

#[tokio::test]
async fn test_create_unbound_volume_is_precondition_failure() {
    let f = fixture().await;
    f.platform
        .add_claim("db", "data-0", "Pending", &["ReadWriteOnce"], &[(LABEL, "cluster-x")])
        .await;

    let err = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.to_string().contains("PVC validation failed for volume 0"));
    assert!(f.platform.created_jobs().await.is_empty());
}

#[tokio::test]
async fn test_create_discovery_failure_is_internal() {
    let f = fixture().await;
    f.add_volume("db", "data-0", "cluster-x").await;

    let err = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.to_string().contains("ETCD discovery failed for volume 0"));
    assert!(err.to_string().contains("no pods found"));
}

#[tokio::test]
async fn test_create_endpoint_mismatch_is_precondition_failure() {
    let f = fixture().await;
    // Same cluster label, different pods: not the same cluster.
    f.add_cluster("east", "cluster-x", &["etcd-0"]).await;
    f.add_cluster("west", "cluster-x", &["etcd-0"]).await;
    f.add_volume("east", "data", "cluster-x").await;
    f.add_volume("west", "data", "cluster-x").await;

    let err = f
        .orchestrator
        .create("daily", &ids(&["east/data", "west/data"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.to_string().contains("endpoints differ for volume 1"));
    assert!(f.platform.created_jobs().await.is_empty());
}

#[tokio::test]
async fn test_create_unhealthy_cluster_is_precondition_failure() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0", "etcd-1", "etcd-2"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    f.dialer.fail_member(2);
    f.dialer.fail_member(3);

    let err = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err
        .to_string()
        .contains("ETCD cluster health validation failed for volume 0"));
    assert!(f.platform.created_jobs().await.is_empty());
}

#[tokio::test]
async fn test_create_failed_job_is_internal_without_metadata() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    f.platform.set_job_behavior(JobBehavior::Fail(3)).await;

    let err = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.to_string().contains("snapshot creation failed"));
    assert!(f
        .platform
        .get_stored_document("kube-system", "etcd-group-snapshot-metadata")
        .await
        .is_none());
}

#[tokio::test]
async fn test_create_succeeds_when_metadata_store_fails() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    f.platform.set_fail_documents(true).await;

    let group = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap();
    assert!(group.ready_to_use);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_in_flight_create() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    f.platform.set_job_behavior(JobBehavior::Hang).await;

    let volumes = ids(&["db/data-0"]);
    let create = f.orchestrator.create("daily", &volumes);
    let stop = async {
        tokio::time::sleep(Duration::from_secs(12)).await;
        f.shutdown.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(create, stop);

    let err = result.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.to_string().contains("cancelled"));
    assert_eq!(f.platform.deleted_jobs().await.len(), 1);
}

#[tokio::test]
async fn test_delete_runs_cleanup_job_against_recorded_claim() {
    let f = fixture().await;
    let metadata = f.metadata();
    metadata
        .store_group(&GroupSnapshotMetadata {
            group_snapshot_id: "daily-1".to_string(),
            snapshot_id: "daily-1-2".to_string(),
            source_volume_ids: ids(&["db/data-0"]),
            cluster_name: "cluster-x".to_string(),
            snapshot_pvc_name: "etcd-snapshots".to_string(),
            snapshot_pvc_namespace: "db".to_string(),
            creation_time: chrono::Utc::now(),
            ready_to_use: true,
        })
        .await
        .unwrap();

    f.orchestrator.delete("daily-1").await.unwrap();

    assert_eq!(
        f.platform.created_jobs().await,
        vec!["etcd-snapshot-delete-daily-1-2"]
    );
    let job = f
        .platform
        .get_stored_job("db", "etcd-snapshot-delete-daily-1-2")
        .await
        .unwrap();
    let volumes = job.spec.unwrap().template.spec.unwrap().volumes.unwrap();
    let claim = volumes[0].persistent_volume_claim.as_ref().unwrap();
    assert_eq!(claim.claim_name, "etcd-snapshots");

    assert!(metadata.retrieve_group("daily-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_succeeds_when_cleanup_job_fails() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;
    let group = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap();

    f.platform.set_job_behavior(JobBehavior::Fail(1)).await;
    f.orchestrator.delete(&group.group_snapshot_id).await.unwrap();

    let err = f.orchestrator.get(&group.group_snapshot_id).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_delete_and_get_require_id() {
    let f = fixture().await;
    assert_eq!(
        f.orchestrator.delete("").await.unwrap_err().code(),
        Code::InvalidArgument
    );
    assert_eq!(
        f.orchestrator.get("").await.unwrap_err().code(),
        Code::InvalidArgument
    );
}

#[tokio::test]
async fn test_get_round_trips_created_group() {
    let f = fixture().await;
    f.add_cluster("db", "cluster-x", &["etcd-0", "etcd-1", "etcd-2"]).await;
    f.add_volume("db", "data-0", "cluster-x").await;

    let created = f.orchestrator.create("daily", &ids(&["db/data-0"])).await.unwrap();
    let fetched = f.orchestrator.get(&created.group_snapshot_id).await.unwrap();

    assert_eq!(fetched, created);
}

#[tokio::test]
async fn test_get_falls_back_to_group_creation_time() {
    let f = fixture().await;
    let created_at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    f.metadata()
        .store_group(&GroupSnapshotMetadata {
            group_snapshot_id: "daily-1".to_string(),
            snapshot_id: "daily-1-2".to_string(),
            source_volume_ids: ids(&["db/data-0"]),
            cluster_name: "cluster-x".to_string(),
            snapshot_pvc_name: "etcd-snapshots".to_string(),
            snapshot_pvc_namespace: "db".to_string(),
            creation_time: created_at,
            ready_to_use: true,
        })
        .await
        .unwrap();

    let group = f.orchestrator.get("daily-1").await.unwrap();
    assert_eq!(group.creation_time, created_at);
    assert_eq!(group.snapshots[0].snapshot_id, "daily-1-2");
    assert_eq!(group.snapshots[0].size_bytes, 0);
}
