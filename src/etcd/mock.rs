//! Scripted etcd dialer for testing.
//!
//! Simulates a cluster of `n` members with ids `1..=n`, member `i` serving
//! `http://etcd-{i-1}:2379`. Members can be failed, demoted to learners, or
//! the reported leader changed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::client::{
    ClientError, ClusterClient, ClusterDialer, Member, MemberListResponse, RangeResponse,
    ResponseHeader,
};

#[derive(Debug, Default)]
struct ClusterState {
    members: Vec<Member>,
    leader: u64,
    failed: HashSet<u64>,
    reachable: bool,
    dials: Vec<Vec<String>>,
}

/// In-memory etcd cluster behind the `ClusterDialer` trait.
#[derive(Clone, Default)]
pub struct MockClusterDialer {
    state: Arc<Mutex<ClusterState>>,
}

fn member_url(id: u64) -> String {
    format!("http://etcd-{}:2379", id - 1)
}

impl MockClusterDialer {
    /// Cluster of `size` healthy voting members with member 1 as leader.
    pub fn healthy_cluster(size: u64) -> Self {
        let members = (1..=size)
            .map(|id| Member {
                id,
                name: format!("etcd-{}", id - 1),
                client_urls: vec![member_url(id)],
                ..Default::default()
            })
            .collect();
        let dialer = Self::default();
        {
            let mut state = dialer.state();
            state.members = members;
            state.leader = 1;
            state.reachable = true;
        }
        dialer
    }

    /// Dialer whose every connection attempt fails.
    pub fn unreachable() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make member `id` fail its liveness probe.
    pub fn fail_member(&self, id: u64) {
        self.state().failed.insert(id);
    }

    pub fn make_learner(&self, id: u64) {
        if let Some(member) = self.state().members.iter_mut().find(|m| m.id == id) {
            member.is_learner = true;
        }
    }

    /// Member id reported in the member list response header.
    pub fn set_leader(&self, id: u64) {
        self.state().leader = id;
    }

    /// Endpoint sets passed to `dial`, in call order.
    pub fn dials(&self) -> Vec<Vec<String>> {
        self.state().dials.clone()
    }
}

#[async_trait]
impl ClusterDialer for MockClusterDialer {
    async fn dial(&self, endpoints: &[String]) -> Result<Box<dyn ClusterClient>, ClientError> {
        let mut state = self.state();
        state.dials.push(endpoints.to_vec());
        if !state.reachable || endpoints.is_empty() {
            return Err(ClientError::Unreachable {
                timeout: Duration::ZERO,
                last_error: "connection refused".to_string(),
            });
        }

        let target = state
            .members
            .iter()
            .find(|m| m.client_urls.first() == endpoints.first())
            .map(|m| m.id);
        Ok(Box::new(MockClusterClient {
            state: Arc::clone(&self.state),
            target,
        }))
    }
}

struct MockClusterClient {
    state: Arc<Mutex<ClusterState>>,
    /// Member whose URL was dialed first, if any.
    target: Option<u64>,
}

impl MockClusterClient {
    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn member_list(&self) -> Result<MemberListResponse, ClientError> {
        let state = self.state();
        Ok(MemberListResponse {
            header: Some(ResponseHeader {
                member_id: state.leader,
                ..Default::default()
            }),
            members: state.members.clone(),
        })
    }

    async fn get(&self, _key: &str) -> Result<RangeResponse, ClientError> {
        let state = self.state();
        match self.target {
            Some(id) if state.failed.contains(&id) => Err(ClientError::Rpc(
                tonic::Status::unavailable(format!("member {} unavailable", id)),
            )),
            _ => Ok(RangeResponse::default()),
        }
    }
}
