//! etcd cluster discovery and health checking.
//!
//! - `discovery`: resolve the etcd cluster behind a volume claim
//! - `health`: quorum and leader validation over the etcd client protocol
//! - `client`: minimal etcd v3 gRPC client
//! - `tls`: client credential loading
//! - `mock`: scripted dialer for testing

pub mod client;
pub mod discovery;
pub mod health;
pub mod mock;
pub mod tls;

pub use client::{ClusterClient, ClusterDialer, GrpcClusterDialer};
pub use discovery::{ClusterDiscovery, DiscoveryError};
pub use health::{HealthError, HealthReport, HealthValidator};

use serde::Serialize;

/// An etcd cluster resolved from a volume claim.
///
/// Produced fresh by every discovery call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    /// Value of the cluster label on the claim.
    pub name: String,
    pub namespace: String,
    /// One client URL per cluster pod, ordered by pod name.
    pub endpoints: Vec<String>,
    /// Whether enough pods exist to form a three-member quorum.
    pub has_quorum: bool,
}

impl ClusterInfo {
    /// Same cluster name and identical, order-sensitive endpoint list.
    pub fn same_cluster(&self, other: &ClusterInfo) -> bool {
        self.name == other.name && self.endpoints == other.endpoints
    }
}
