//! Source volume identifiers and claim checks.

use std::fmt;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use crate::interfaces::{PlatformError, VolumeDirectory};

/// Namespace used when a volume id carries none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Access modes that allow the snapshot job to read a consistent volume.
const WRITE_ACCESS_MODES: [&str; 3] = ["ReadWriteOnce", "ReadWriteMany", "ReadWriteOncePod"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VolumeIdError {
    #[error("volume id is empty")]
    Empty,

    #[error("volume id {0:?} has an empty namespace")]
    EmptyNamespace(String),

    #[error("volume id {0:?} has an empty name")]
    EmptyName(String),
}

/// A claim addressed as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeReference {
    pub namespace: String,
    pub name: String,
}

impl VolumeReference {
    /// Split `id` on its last `/`. Ids without one live in `default`.
    pub fn parse(id: &str) -> Result<Self, VolumeIdError> {
        if id.is_empty() {
            return Err(VolumeIdError::Empty);
        }
        match id.rsplit_once('/') {
            None => Ok(Self {
                namespace: DEFAULT_NAMESPACE.to_string(),
                name: id.to_string(),
            }),
            Some(("", _)) => Err(VolumeIdError::EmptyNamespace(id.to_string())),
            Some((_, "")) => Err(VolumeIdError::EmptyName(id.to_string())),
            Some((namespace, name)) => Ok(Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for VolumeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("PVC {0} not found")]
    NotFound(VolumeReference),

    #[error("PVC not bound, current phase: {0}")]
    NotBound(String),

    #[error("PVC does not have write access mode")]
    NoWriteAccess,

    #[error("failed to read PVC: {0}")]
    Platform(#[from] PlatformError),
}

/// Check that a claim is bound and writable.
pub fn check_claim(claim: &PersistentVolumeClaim) -> Result<(), ClaimError> {
    let phase = claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    if phase != "Bound" {
        return Err(ClaimError::NotBound(phase.to_string()));
    }

    let writable = claim
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.as_ref())
        .is_some_and(|modes| {
            modes
                .iter()
                .any(|m| WRITE_ACCESS_MODES.contains(&m.as_str()))
        });
    if !writable {
        return Err(ClaimError::NoWriteAccess);
    }
    Ok(())
}

/// Fetch the claim behind `volume` and run `check_claim` on it.
pub async fn validate_claim(
    volumes: &dyn VolumeDirectory,
    volume: &VolumeReference,
) -> Result<(), ClaimError> {
    let claim = volumes
        .get_claim(&volume.namespace, &volume.name)
        .await?
        .ok_or_else(|| ClaimError::NotFound(volume.clone()))?;
    check_claim(&claim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;

    #[test]
    fn test_parse_splits_at_last_separator() {
        let volume = VolumeReference::parse("team/db/data-0").unwrap();
        assert_eq!(volume.namespace, "team/db");
        assert_eq!(volume.name, "data-0");
    }

    #[test]
    fn test_parse_without_separator_uses_default_namespace() {
        let volume = VolumeReference::parse("data-0").unwrap();
        assert_eq!(volume.namespace, DEFAULT_NAMESPACE);
        assert_eq!(volume.name, "data-0");
        assert_eq!(volume.to_string(), "default/data-0");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert_eq!(VolumeReference::parse(""), Err(VolumeIdError::Empty));
        assert!(matches!(
            VolumeReference::parse("/data-0"),
            Err(VolumeIdError::EmptyNamespace(_))
        ));
        assert!(matches!(
            VolumeReference::parse("db/"),
            Err(VolumeIdError::EmptyName(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_claim_states() {
        let platform = MockPlatform::new();
        platform.add_claim("db", "bound", "Bound", &["ReadWriteOncePod"], &[]).await;
        platform.add_claim("db", "pending", "Pending", &["ReadWriteOnce"], &[]).await;
        platform.add_claim("db", "readonly", "Bound", &["ReadOnlyMany"], &[]).await;

        let check = |name: &str| VolumeReference {
            namespace: "db".to_string(),
            name: name.to_string(),
        };

        assert!(validate_claim(&platform, &check("bound")).await.is_ok());
        assert_eq!(
            validate_claim(&platform, &check("pending"))
                .await
                .unwrap_err()
                .to_string(),
            "PVC not bound, current phase: Pending"
        );
        assert!(matches!(
            validate_claim(&platform, &check("readonly")).await,
            Err(ClaimError::NoWriteAccess)
        ));
        assert!(matches!(
            validate_claim(&platform, &check("absent")).await,
            Err(ClaimError::NotFound(_))
        ));
    }
}
