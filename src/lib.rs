//! etcd-snapshot-driver: group snapshots for etcd clusters on Kubernetes.
//!
//! A group snapshot covers every data volume of one etcd cluster. The driver
//! discovers the cluster behind the volumes, checks its quorum and leader,
//! runs a single `etcdctl snapshot save` job against the members and records
//! the result in ConfigMap-backed metadata.
//!
//! The Kubernetes and etcd surfaces sit behind traits (`interfaces` and
//! `etcd::ClusterDialer`) with in-memory mocks for tests.

pub mod config;
pub mod etcd;
pub mod interfaces;
pub mod job;
pub mod orchestration;
pub mod platform;
pub mod storage;
pub mod utils;

/// Value of the `app` label on resources the driver creates.
pub const APP_NAME: &str = "etcd-snapshot-driver";
