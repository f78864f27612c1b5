//! Application configuration.
//!
//! A single `Config` record loaded from YAML files and environment variables,
//! validated once at startup and never mutated afterwards.

mod sections;

pub use sections::{
    ClusterConfig, ControllerTlsConfig, HealthConfig, ImagesConfig, LogFormat, LoggingConfig,
    ServerConfig, SnapshotConfig, StorageConfig, TlsConfig,
};

use serde::Deserialize;

use crate::storage::quantity::parse_quantity;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "etcd-snapshot-driver.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ETCD_SNAPSHOT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ETCD_SNAPSHOT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ETCD_SNAPSHOT_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub snapshot: SnapshotConfig,
    pub storage: StorageConfig,
    pub images: ImagesConfig,
    pub tls: TlsConfig,
    pub health: HealthConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `etcd-snapshot-driver.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check cross-field constraints once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.label_key.trim().is_empty() {
            return Err(invalid("cluster.label_key", "must not be empty"));
        }
        if self.cluster.client_port == 0 {
            return Err(invalid("cluster.client_port", "must be non-zero"));
        }

        if let Err(e) = parse_quantity(&self.storage.pvc_size) {
            return Err(invalid("storage.pvc_size", e.to_string()));
        }
        if self.storage.metadata_namespace.is_empty() {
            return Err(invalid("storage.metadata_namespace", "must not be empty"));
        }

        let snapshot = &self.snapshot;
        if snapshot.timeout_secs == 0 {
            return Err(invalid("snapshot.timeout_secs", "must be non-zero"));
        }
        if snapshot.poll_interval_secs == 0 {
            return Err(invalid("snapshot.poll_interval_secs", "must be non-zero"));
        }
        if snapshot.cleanup_timeout_secs == 0 {
            return Err(invalid("snapshot.cleanup_timeout_secs", "must be non-zero"));
        }
        if snapshot.job_backoff_limit < 0 {
            return Err(invalid("snapshot.job_backoff_limit", "must not be negative"));
        }
        if snapshot.job_active_deadline_secs <= 0 {
            return Err(invalid("snapshot.job_active_deadline_secs", "must be positive"));
        }

        if self.health.dial_timeout_secs == 0 {
            return Err(invalid("health.dial_timeout_secs", "must be non-zero"));
        }

        if let Err(e) = self.server.health_address.parse::<std::net::SocketAddr>() {
            return Err(invalid("server.health_address", e.to_string()));
        }
        if self.server.readiness_interval_secs == 0 {
            return Err(invalid("server.readiness_interval_secs", "must be non-zero"));
        }

        if self.tls.enabled {
            let tls = &self.tls;
            for (field, value) in [
                ("tls.secret_name", &tls.secret_name),
                ("tls.client_cert_path", &tls.client_cert_path),
                ("tls.client_key_path", &tls.client_key_path),
                ("tls.ca_path", &tls.ca_path),
            ] {
                if value.is_empty() {
                    return Err(invalid(field, "required when tls.enabled is set"));
                }
            }
            // Discovered endpoints are https; the health checker needs its own
            // credentials to reach them.
            if self.health.controller_tls.is_none() {
                return Err(invalid(
                    "health.controller_tls",
                    "required when tls.enabled is set",
                ));
            }
        }

        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_controller_tls(mut config: Config) -> Config {
        config.health.controller_tls = Some(ControllerTlsConfig {
            cert_path: "/var/run/etcd/client.crt".to_string(),
            key_path: "/var/run/etcd/client.key".to_string(),
            ca_path: "/var/run/etcd/ca.crt".to_string(),
        });
        config
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.cluster.label_key, "etcd.io/cluster");
        assert_eq!(config.storage.pvc_size, "10Gi");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.tls.enabled);
        assert!(with_controller_tls(config).validate().is_ok());
    }

    #[test]
    fn test_validate_requires_controller_tls_when_tls_enabled() {
        let config = Config::for_test();
        assert!(config.tls.enabled);
        assert!(config.health.controller_tls.is_none());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("health.controller_tls"), "{err}");

        let mut plaintext = Config::for_test();
        plaintext.tls.enabled = false;
        assert!(plaintext.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_pvc_size() {
        let mut config = Config::for_test();
        config.storage.pvc_size = "ten".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.pvc_size"));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = Config::for_test();
        config.snapshot.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_tls_paths_only_when_enabled() {
        let mut config = with_controller_tls(Config::for_test());
        config.tls.secret_name.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tls.secret_name"), "{err}");

        config.tls.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unparseable_health_address() {
        let mut config = Config::for_test();
        config.server.health_address = "localhost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.health_address"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "snapshot:\n  timeout_secs: 42\nstorage:\n  storage_class: fast\nlogging:\n  format: console"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.snapshot.timeout_secs, 42);
        assert_eq!(config.snapshot.poll_interval_secs, 5);
        assert_eq!(config.storage.storage_class, "fast");
        assert_eq!(config.logging.format, LogFormat::Console);
    }
}
