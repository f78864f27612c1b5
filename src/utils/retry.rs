//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::interfaces::PlatformError;

/// Backoff for metadata document compare-and-swap retries.
///
/// - Min delay: 10ms
/// - Max delay: 1s
/// - Max attempts: 8
/// - Jitter enabled
pub fn metadata_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(8)
        .with_jitter()
}

/// Determines if a document write lost a race with another writer.
///
/// Retryable:
/// - `Conflict`: stale `resourceVersion` on replace
/// - `AlreadyExists`: another writer created the document first
///
/// Everything else reflects a platform problem that a re-read will not fix.
pub fn is_write_race(err: &PlatformError) -> bool {
    err.is_conflict() || err.is_already_exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: &str) -> PlatformError {
        let (namespace, name) = ("ns".to_string(), "doc".to_string());
        match kind {
            "conflict" => PlatformError::Conflict { kind: "ConfigMap", namespace, name },
            "exists" => PlatformError::AlreadyExists { kind: "ConfigMap", namespace, name },
            _ => PlatformError::NotFound { kind: "ConfigMap", namespace, name },
        }
    }

    #[test]
    fn test_is_write_race() {
        assert!(is_write_race(&err("conflict")));
        assert!(is_write_race(&err("exists")));
        assert!(!is_write_race(&err("missing")));
    }
}
