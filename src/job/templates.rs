//! Snapshot Job builders.
//!
//! Save jobs run `etcdctl snapshot save` against the cluster and write the
//! artifact to `/snapshots/<id>.db` on the snapshot claim, then print the
//! artifact status as JSON for the executor to pick up from the logs.
//! Delete jobs remove the artifact file.
//!
//! Both run as an unprivileged user with a read-only root filesystem; `/tmp`
//! is an `emptyDir`.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, KeyToPath, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, SeccompProfile,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::{Config, TlsConfig};
use crate::APP_NAME;

pub const DEFAULT_ETCD_IMAGE: &str = "quay.io/coreos/etcd:v3.5.0";
pub const DEFAULT_BUSYBOX_IMAGE: &str = "busybox:1.35";

/// Service account the job pods run as.
pub const EXECUTOR_SERVICE_ACCOUNT: &str = "etcd-snapshot-executor";

const TTL_SECONDS_AFTER_FINISHED: i32 = 3600;
const NOBODY_UID: i64 = 65534;

const SNAPSHOT_MOUNT_PATH: &str = "/snapshots";
const TMP_MOUNT_PATH: &str = "/tmp";
const CLIENT_TLS_MOUNT_PATH: &str = "/etc/etcd/tls/client";
const CA_MOUNT_PATH: &str = "/etc/etcd/tls/etcd-ca";

const SNAPSHOT_VOLUME: &str = "snapshot-pvc";
const TMP_VOLUME: &str = "tmp";
const CLIENT_TLS_VOLUME: &str = "etcd-client-tls";
const CA_VOLUME: &str = "etcd-ca";

/// Operation label values.
pub const OPERATION_SAVE: &str = "snapshot-save";
pub const OPERATION_DELETE: &str = "snapshot-delete";

/// Client TLS material as mounted inside the job container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTls {
    /// Secret with `etcd-client.crt`, `etcd-client.key` and `etcd-client-ca.crt`.
    pub secret_name: String,
    pub client_cert_path: String,
    pub client_key_path: String,
    pub ca_path: String,
}

impl From<&TlsConfig> for JobTls {
    fn from(tls: &TlsConfig) -> Self {
        Self {
            secret_name: tls.secret_name.clone(),
            client_cert_path: tls.client_cert_path.clone(),
            client_key_path: tls.client_key_path.clone(),
            ca_path: tls.ca_path.clone(),
        }
    }
}

/// Parameters of one snapshot job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub snapshot_id: String,
    /// Namespace the job runs in. Must be the snapshot claim's namespace.
    pub namespace: String,
    pub endpoints: Vec<String>,
    pub snapshot_pvc_name: String,
    pub backoff_limit: i32,
    pub active_deadline_secs: i64,
    /// `None` connects to etcd in plaintext.
    pub tls: Option<JobTls>,
    /// Empty selects `DEFAULT_ETCD_IMAGE`.
    pub etcd_image: String,
    /// Empty selects `DEFAULT_BUSYBOX_IMAGE`.
    pub busybox_image: String,
}

impl JobConfig {
    /// Job parameters with limits, images and TLS taken from `config`.
    pub fn from_config(
        config: &Config,
        snapshot_id: impl Into<String>,
        namespace: impl Into<String>,
        snapshot_pvc_name: impl Into<String>,
        endpoints: Vec<String>,
    ) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            namespace: namespace.into(),
            endpoints,
            snapshot_pvc_name: snapshot_pvc_name.into(),
            backoff_limit: config.snapshot.job_backoff_limit,
            active_deadline_secs: config.snapshot.job_active_deadline_secs,
            tls: config.tls.enabled.then(|| JobTls::from(&config.tls)),
            etcd_image: config.images.etcd.clone(),
            busybox_image: config.images.busybox.clone(),
        }
    }

    fn artifact_path(&self) -> String {
        format!("{}/{}.db", SNAPSHOT_MOUNT_PATH, self.snapshot_id)
    }
}

const SAVE_JOB_PREFIX: &str = "etcd-snapshot-save-";
const DELETE_JOB_PREFIX: &str = "etcd-snapshot-delete-";

/// Longest Kubernetes object name (RFC 1123 label).
const MAX_OBJECT_NAME_LEN: usize = 63;
/// Two `-<unix seconds>` suffixes: group id, then snapshot id.
const SNAPSHOT_ID_SUFFIX_LEN: usize = 2 * 11;

/// Longest snapshot name whose job names still fit an object name.
pub const MAX_SNAPSHOT_NAME_LEN: usize = MAX_OBJECT_NAME_LEN
    - if SAVE_JOB_PREFIX.len() > DELETE_JOB_PREFIX.len() {
        SAVE_JOB_PREFIX.len()
    } else {
        DELETE_JOB_PREFIX.len()
    }
    - SNAPSHOT_ID_SUFFIX_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotNameError {
    #[error("name is empty")]
    Empty,

    #[error("name is {len} characters, at most {max} allowed")]
    TooLong { len: usize, max: usize },

    #[error("name {0:?} must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric")]
    NotDnsLabel(String),
}

/// Check that `name` can prefix snapshot ids, job names and label values.
pub fn check_snapshot_name(name: &str) -> Result<(), SnapshotNameError> {
    if name.is_empty() {
        return Err(SnapshotNameError::Empty);
    }
    if name.len() > MAX_SNAPSHOT_NAME_LEN {
        return Err(SnapshotNameError::TooLong {
            len: name.len(),
            max: MAX_SNAPSHOT_NAME_LEN,
        });
    }
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = name.chars().all(|c| alnum(c) || c == '-')
        && name.starts_with(alnum)
        && name.ends_with(alnum);
    if !valid {
        return Err(SnapshotNameError::NotDnsLabel(name.to_string()));
    }
    Ok(())
}

/// Name of the save job for `snapshot_id`.
pub fn save_job_name(snapshot_id: &str) -> String {
    format!("{}{}", SAVE_JOB_PREFIX, snapshot_id)
}

/// Name of the delete job for `snapshot_id`.
pub fn delete_job_name(snapshot_id: &str) -> String {
    format!("{}{}", DELETE_JOB_PREFIX, snapshot_id)
}

/// Single-quote `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell script run by the save container.
pub fn save_command(cfg: &JobConfig) -> String {
    let mut save = format!(
        "etcdctl --endpoints={}",
        shell_quote(&cfg.endpoints.join(","))
    );
    if let Some(tls) = &cfg.tls {
        save.push_str(&format!(
            " --cacert {} --cert {} --key {}",
            shell_quote(&tls.ca_path),
            shell_quote(&tls.client_cert_path),
            shell_quote(&tls.client_key_path)
        ));
    }
    let artifact = shell_quote(&cfg.artifact_path());
    save.push_str(&format!(" snapshot save {}", artifact));

    format!(
        "set -e\n{}\netcdutl snapshot status {} -w json\n",
        save, artifact
    )
}

// ─── Object helpers ───────────────────────────────────────────────────────────

fn job_labels(cfg: &JobConfig, operation: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_NAME.to_string()),
        ("operation".to_string(), operation.to_string()),
        ("snapshot-id".to_string(), cfg.snapshot_id.clone()),
    ])
}

fn pod_labels(cfg: &JobConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_NAME.to_string()),
        ("snapshot-id".to_string(), cfg.snapshot_id.clone()),
    ])
}

fn resources(request_cpu: &str, request_memory: &str, limit_cpu: &str, limit_memory: &str) -> ResourceRequirements {
    let list = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(list(request_cpu, request_memory)),
        limits: Some(list(limit_cpu, limit_memory)),
        ..Default::default()
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(NOBODY_UID),
        fs_group: Some(NOBODY_UID),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        read_only_root_filesystem: Some(true),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn artifact_volumes(cfg: &JobConfig) -> Vec<Volume> {
    vec![
        Volume {
            name: SNAPSHOT_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: cfg.snapshot_pvc_name.clone(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
        Volume {
            name: TMP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

fn secret_volume(name: &str, secret_name: &str, items: &[(&str, &str)]) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            items: Some(
                items
                    .iter()
                    .map(|(key, path)| KeyToPath {
                        key: key.to_string(),
                        path: path.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_job(
    cfg: &JobConfig,
    name: String,
    operation: &str,
    container: Container,
    volumes: Vec<Volume>,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(cfg.namespace.clone()),
            labels: Some(job_labels(cfg, operation)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
            backoff_limit: Some(cfg.backoff_limit),
            active_deadline_seconds: Some(cfg.active_deadline_secs),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(cfg)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(EXECUTOR_SERVICE_ACCOUNT.to_string()),
                    restart_policy: Some("Never".to_string()),
                    security_context: Some(pod_security_context()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

// ─── Job builders ─────────────────────────────────────────────────────────────

/// Build the save job for `cfg.snapshot_id`.
pub fn generate_save_job(cfg: &JobConfig) -> Job {
    let image = if cfg.etcd_image.is_empty() {
        DEFAULT_ETCD_IMAGE.to_string()
    } else {
        cfg.etcd_image.clone()
    };

    let mut mounts = vec![
        mount(SNAPSHOT_VOLUME, SNAPSHOT_MOUNT_PATH, false),
        mount(TMP_VOLUME, TMP_MOUNT_PATH, false),
    ];
    let mut volumes = artifact_volumes(cfg);

    if let Some(tls) = &cfg.tls {
        mounts.push(mount(CLIENT_TLS_VOLUME, CLIENT_TLS_MOUNT_PATH, true));
        mounts.push(mount(CA_VOLUME, CA_MOUNT_PATH, true));
        volumes.push(secret_volume(
            CLIENT_TLS_VOLUME,
            &tls.secret_name,
            &[
                ("etcd-client.crt", "etcd-client.crt"),
                ("etcd-client.key", "etcd-client.key"),
            ],
        ));
        volumes.push(secret_volume(
            CA_VOLUME,
            &tls.secret_name,
            &[("etcd-client-ca.crt", "ca.crt")],
        ));
    }

    let container = Container {
        name: "etcd-snapshot".to_string(),
        image: Some(image),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            save_command(cfg),
        ]),
        volume_mounts: Some(mounts),
        security_context: Some(container_security_context()),
        resources: Some(resources("100m", "256Mi", "500m", "512Mi")),
        ..Default::default()
    };

    build_job(
        cfg,
        save_job_name(&cfg.snapshot_id),
        OPERATION_SAVE,
        container,
        volumes,
    )
}

/// Build the job removing the artifact of `cfg.snapshot_id`.
pub fn generate_delete_job(cfg: &JobConfig) -> Job {
    let image = if cfg.busybox_image.is_empty() {
        DEFAULT_BUSYBOX_IMAGE.to_string()
    } else {
        cfg.busybox_image.clone()
    };

    let container = Container {
        name: "rm".to_string(),
        image: Some(image),
        command: Some(vec![
            "rm".to_string(),
            "-f".to_string(),
            cfg.artifact_path(),
        ]),
        volume_mounts: Some(vec![
            mount(SNAPSHOT_VOLUME, SNAPSHOT_MOUNT_PATH, false),
            mount(TMP_VOLUME, TMP_MOUNT_PATH, false),
        ]),
        security_context: Some(container_security_context()),
        resources: Some(resources("50m", "32Mi", "100m", "128Mi")),
        ..Default::default()
    };

    build_job(
        cfg,
        delete_job_name(&cfg.snapshot_id),
        OPERATION_DELETE,
        container,
        artifact_volumes(cfg),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(tls: bool) -> JobConfig {
        let mut config = Config::for_test();
        config.tls.enabled = tls;
        JobConfig::from_config(
            &config,
            "daily-1700000000-1700000000",
            "db",
            "etcd-snapshots",
            vec![
                "https://etcd-0.db.svc.cluster.local:2379".to_string(),
                "https://etcd-1.db.svc.cluster.local:2379".to_string(),
            ],
        )
    }

    fn pod_spec(job: &Job) -> PodSpec {
        job.spec.clone().unwrap().template.spec.unwrap()
    }

    // ── Save job ──────────────────────────────────────────────────────────────

    #[test]
    fn test_save_job_name_and_labels() {
        let job = generate_save_job(&test_cfg(true));
        assert_eq!(
            job.metadata.name.as_deref(),
            Some("etcd-snapshot-save-daily-1700000000-1700000000")
        );
        assert_eq!(job.metadata.namespace.as_deref(), Some("db"));
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels["app"], "etcd-snapshot-driver");
        assert_eq!(labels["operation"], OPERATION_SAVE);
        assert_eq!(labels["snapshot-id"], "daily-1700000000-1700000000");
    }

    #[test]
    fn test_save_command_lists_endpoints_comma_separated() {
        let command = save_command(&test_cfg(false));
        assert!(command.contains(
            "etcdctl --endpoints='https://etcd-0.db.svc.cluster.local:2379,https://etcd-1.db.svc.cluster.local:2379' snapshot save '/snapshots/daily-1700000000-1700000000.db'"
        ));
        assert!(command.contains("etcdutl snapshot status '/snapshots/daily-1700000000-1700000000.db' -w json"));
        assert!(!command.contains("--cacert"));
    }

    #[test]
    fn test_save_command_with_tls_flags() {
        let command = save_command(&test_cfg(true));
        assert!(command.contains("--cacert '/etc/etcd/tls/etcd-ca/ca.crt'"));
        assert!(command.contains("--cert '/etc/etcd/tls/client/etcd-client.crt'"));
        assert!(command.contains("--key '/etc/etcd/tls/client/etcd-client.key'"));
    }

    #[test]
    fn test_save_command_quotes_artifact_path() {
        let mut cfg = test_cfg(false);
        cfg.snapshot_id = "x;touch /snapshots/pwned;#-1700000000-1700000000".to_string();
        let command = save_command(&cfg);
        assert!(command.contains(
            "snapshot save '/snapshots/x;touch /snapshots/pwned;#-1700000000-1700000000.db'\n"
        ));
        assert!(!command.contains("save /snapshots/x;"));

        cfg.snapshot_id = "it's".to_string();
        let command = save_command(&cfg);
        assert!(command.contains(r"snapshot save '/snapshots/it'\''s.db'"));
    }

    #[test]
    fn test_check_snapshot_name() {
        assert_eq!(MAX_SNAPSHOT_NAME_LEN, 20);
        assert!(check_snapshot_name("daily").is_ok());
        assert!(check_snapshot_name("nightly-2024-01").is_ok());
        assert!(check_snapshot_name(&"a".repeat(MAX_SNAPSHOT_NAME_LEN)).is_ok());

        assert_eq!(check_snapshot_name(""), Err(SnapshotNameError::Empty));
        assert!(matches!(
            check_snapshot_name(&"a".repeat(MAX_SNAPSHOT_NAME_LEN + 1)),
            Err(SnapshotNameError::TooLong { len: 21, max: 20 })
        ));
        for bad in ["x;rm", "Daily", "-daily", "daily-", "a b", "a_b", "a.b"] {
            assert!(
                matches!(check_snapshot_name(bad), Err(SnapshotNameError::NotDnsLabel(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_longest_name_keeps_job_names_within_limit() {
        let name = "a".repeat(MAX_SNAPSHOT_NAME_LEN);
        let snapshot_id = format!("{}-{}-{}", name, 1_700_000_000, 1_700_000_000);
        assert!(save_job_name(&snapshot_id).len() <= 63);
        assert_eq!(delete_job_name(&snapshot_id).len(), 63);
    }

    #[test]
    fn test_save_job_mounts_tls_secret_read_only() {
        let spec = pod_spec(&generate_save_job(&test_cfg(true)));
        let volumes = spec.volumes.unwrap_or_default();
        assert!(volumes.iter().any(|v| v.name == CLIENT_TLS_VOLUME));
        assert!(volumes.iter().any(|v| v.name == CA_VOLUME));

        let mounts = spec.containers[0].volume_mounts.clone().unwrap_or_default();
        let ca = mounts.iter().find(|m| m.name == CA_VOLUME).unwrap();
        assert_eq!(ca.mount_path, "/etc/etcd/tls/etcd-ca");
        assert_eq!(ca.read_only, Some(true));
    }

    #[test]
    fn test_save_job_without_tls_has_no_secret_volumes() {
        let spec = pod_spec(&generate_save_job(&test_cfg(false)));
        let volumes = spec.volumes.unwrap_or_default();
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|v| v.secret.is_none()));
    }

    #[test]
    fn test_save_job_hardening() {
        let job = generate_save_job(&test_cfg(true));
        let job_spec = job.spec.clone().unwrap();
        assert_eq!(job_spec.backoff_limit, Some(3));
        assert_eq!(job_spec.active_deadline_seconds, Some(600));
        assert_eq!(job_spec.ttl_seconds_after_finished, Some(3600));

        let spec = pod_spec(&job);
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.service_account_name.as_deref(),
            Some(EXECUTOR_SERVICE_ACCOUNT)
        );
        let pod_security = spec.security_context.unwrap();
        assert_eq!(pod_security.run_as_user, Some(65534));
        assert_eq!(pod_security.seccomp_profile.unwrap().type_, "RuntimeDefault");

        let container = &spec.containers[0];
        let security = container.security_context.clone().unwrap();
        assert_eq!(security.allow_privilege_escalation, Some(false));
        assert_eq!(security.read_only_root_filesystem, Some(true));
        assert_eq!(security.capabilities.unwrap().drop, Some(vec!["ALL".to_string()]));

        let limits = container.resources.clone().unwrap().limits.unwrap();
        assert_eq!(limits["cpu"], Quantity("500m".to_string()));
        assert_eq!(limits["memory"], Quantity("512Mi".to_string()));
    }

    #[test]
    fn test_empty_image_falls_back_to_default() {
        let mut cfg = test_cfg(false);
        cfg.etcd_image.clear();
        cfg.busybox_image.clear();

        let save = pod_spec(&generate_save_job(&cfg));
        assert_eq!(save.containers[0].image.as_deref(), Some(DEFAULT_ETCD_IMAGE));
        let delete = pod_spec(&generate_delete_job(&cfg));
        assert_eq!(delete.containers[0].image.as_deref(), Some(DEFAULT_BUSYBOX_IMAGE));
    }

    // ── Delete job ────────────────────────────────────────────────────────────

    #[test]
    fn test_delete_job_removes_artifact() {
        let job = generate_delete_job(&test_cfg(true));
        assert_eq!(
            job.metadata.name.as_deref(),
            Some("etcd-snapshot-delete-daily-1700000000-1700000000")
        );
        assert_eq!(job.metadata.labels.clone().unwrap()["operation"], OPERATION_DELETE);

        let spec = pod_spec(&job);
        let container = &spec.containers[0];
        assert_eq!(container.name, "rm");
        assert_eq!(
            container.command.clone().unwrap(),
            vec!["rm", "-f", "/snapshots/daily-1700000000-1700000000.db"]
        );
        let requests = container.resources.clone().unwrap().requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("50m".to_string()));

        // TLS material is never mounted for deletion.
        let volumes = spec.volumes.unwrap_or_default();
        assert!(volumes.iter().any(|v| v.name == SNAPSHOT_VOLUME));
        assert!(volumes.iter().all(|v| v.secret.is_none()));
    }
}
