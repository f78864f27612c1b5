//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Exporter wiring is left to the deployment; without one the global meter
//! is a no-op.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("etcd-snapshot-driver"));

// ============================================================================
// Group snapshot operations
// ============================================================================

/// Duration of create/delete/get.
pub static OPERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("etcd_snapshot.operation.duration")
        .with_description("Group snapshot operation duration")
        .with_unit("s")
        .build()
});

/// Total group snapshot operations.
pub static OPERATION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("etcd_snapshot.operation.total")
        .with_description("Total group snapshot operations")
        .build()
});

// ============================================================================
// Jobs
// ============================================================================

/// Time from job submission to a terminal state.
pub static JOB_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("etcd_snapshot.job.duration")
        .with_description("Snapshot job duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Cluster health
// ============================================================================

/// Total failed cluster health validations.
pub static CLUSTER_HEALTH_FAILURES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("etcd_snapshot.cluster.health_failures")
        .with_description("Total failed etcd cluster health validations")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create an operation label (create, delete, get, snapshot-save, ...).
pub fn operation_attr(operation: &str) -> KeyValue {
    KeyValue::new("operation", operation.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create an etcd cluster label.
pub fn cluster_attr(cluster: &str) -> KeyValue {
    KeyValue::new("cluster", cluster.to_string())
}
