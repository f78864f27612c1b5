//! Configuration sections.

use std::time::Duration;

use serde::Deserialize;

/// How etcd clusters are identified and reached.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Label on both the data claim and the etcd pods naming the cluster.
    pub label_key: String,
    /// etcd client port on every pod.
    pub client_port: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            label_key: "etcd.io/cluster".to_string(),
            client_port: 2379,
        }
    }
}

/// Snapshot job behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Upper bound on waiting for a save job.
    pub timeout_secs: u64,
    /// Interval between job status reads.
    pub poll_interval_secs: u64,
    pub job_backoff_limit: i32,
    pub job_active_deadline_secs: i64,
    /// Upper bound on waiting for a delete job.
    pub cleanup_timeout_secs: u64,
    /// Delete jobs that outlive their wait instead of leaving them running.
    pub delete_timed_out_jobs: bool,
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_secs: 5,
            job_backoff_limit: 3,
            job_active_deadline_secs: 600,
            cleanup_timeout_secs: 60,
            delete_timed_out_jobs: true,
        }
    }
}

/// Snapshot artifact and metadata storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Requested capacity of the snapshot claim, as a Kubernetes quantity.
    pub pvc_size: String,
    /// Storage class of the snapshot claim. Empty uses the platform default.
    pub storage_class: String,
    /// Namespace holding the metadata documents.
    pub metadata_namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pvc_size: "10Gi".to_string(),
            storage_class: String::new(),
            metadata_namespace: "kube-system".to_string(),
        }
    }
}

/// Container images for snapshot jobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub etcd: String,
    pub busybox: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            etcd: "quay.io/coreos/etcd:v3.5.0".to_string(),
            busybox: "busybox:1.35".to_string(),
        }
    }
}

/// TLS settings passed to snapshot jobs.
///
/// Paths are as seen inside the job container, where the secret and CA are
/// mounted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Secret holding the etcd client certificate, key and CA.
    pub secret_name: String,
    pub client_cert_path: String,
    pub client_key_path: String,
    pub ca_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret_name: "etcd-client-tls".to_string(),
            client_cert_path: "/etc/etcd/tls/client/etcd-client.crt".to_string(),
            client_key_path: "/etc/etcd/tls/client/etcd-client.key".to_string(),
            ca_path: "/etc/etcd/tls/etcd-ca/ca.crt".to_string(),
        }
    }
}

/// Credentials the controller itself uses for health checks.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerTlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
}

/// Cluster health checking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Bound on each dial, member list and member probe.
    pub dial_timeout_secs: u64,
    /// Client credentials for the health checker. Without them the checker
    /// dials in plaintext.
    pub controller_tls: Option<ControllerTlsConfig>,
}

impl HealthConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 5,
            controller_tls: None,
        }
    }
}

/// Process health endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the gRPC health service.
    pub health_address: String,
    pub readiness_interval_secs: u64,
}

impl ServerConfig {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_address: "0.0.0.0:8080".to_string(),
            readiness_interval_secs: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Console,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}
