//! Quorum and leader validation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::client::{ClientError, ClusterDialer, Member};

/// Key read by the per-member liveness probe.
const HEALTH_KEY: &str = "health";

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("no endpoints provided")]
    NoEndpoints,

    #[error("failed to connect to etcd cluster: {0}")]
    Connect(#[source] ClientError),

    #[error("failed to list members: {0}")]
    MemberList(#[source] ClientError),

    #[error("member list timed out after {0:?}")]
    MemberListTimeout(Duration),

    #[error("cluster reported no members")]
    NoMembers,

    #[error("cluster has no voting members")]
    NoVotingMembers,

    #[error("insufficient healthy members: {healthy}/{voting} healthy, {required} required for quorum")]
    InsufficientQuorum {
        healthy: usize,
        voting: usize,
        required: usize,
    },

    #[error("cluster has no leader")]
    NoLeader,
}

/// Outcome of a successful health validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: usize,
    pub voting: usize,
    pub quorum_required: usize,
}

/// Smallest majority of `voting` members.
pub fn quorum_required(voting: usize) -> usize {
    voting / 2 + 1
}

/// Checks that a cluster has a healthy voting majority and a leader.
pub struct HealthValidator {
    dialer: Arc<dyn ClusterDialer>,
    timeout: Duration,
}

impl HealthValidator {
    /// `timeout` bounds the member list call and each member probe.
    pub fn new(dialer: Arc<dyn ClusterDialer>, timeout: Duration) -> Self {
        Self { dialer, timeout }
    }

    pub async fn validate_health(&self, endpoints: &[String]) -> Result<HealthReport, HealthError> {
        if endpoints.is_empty() {
            return Err(HealthError::NoEndpoints);
        }

        let client = self
            .dialer
            .dial(endpoints)
            .await
            .map_err(HealthError::Connect)?;

        let response = tokio::time::timeout(self.timeout, client.member_list())
            .await
            .map_err(|_| HealthError::MemberListTimeout(self.timeout))?
            .map_err(HealthError::MemberList)?;

        if response.members.is_empty() {
            return Err(HealthError::NoMembers);
        }

        let voting: Vec<&Member> = response.members.iter().filter(|m| !m.is_learner).collect();
        if voting.is_empty() {
            return Err(HealthError::NoVotingMembers);
        }
        let required = quorum_required(voting.len());

        let probes = voting.iter().map(|member| self.probe_member(member));
        let healthy = join_all(probes).await.into_iter().filter(|ok| *ok).count();

        let leader_id = response.header.as_ref().map(|h| h.member_id);
        let has_leader = leader_id.is_some_and(|id| response.members.iter().any(|m| m.id == id));

        debug!(
            healthy,
            voting = voting.len(),
            required,
            has_leader,
            "Cluster health evaluated"
        );

        if healthy < required {
            return Err(HealthError::InsufficientQuorum {
                healthy,
                voting: voting.len(),
                required,
            });
        }
        if !has_leader {
            return Err(HealthError::NoLeader);
        }

        info!(healthy, voting = voting.len(), "etcd cluster healthy");
        Ok(HealthReport {
            healthy,
            voting: voting.len(),
            quorum_required: required,
        })
    }

    /// Dial one member on its own and read the health key. Never fails the
    /// validation; problems count the member as unhealthy.
    async fn probe_member(&self, member: &Member) -> bool {
        let Some(url) = member.client_urls.first() else {
            warn!(member = %member.name, "Member has no client URL");
            return false;
        };

        let probe = async {
            let client = self.dialer.dial(std::slice::from_ref(url)).await?;
            client.get(HEALTH_KEY).await
        };

        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(member = %member.name, endpoint = %url, error = %e, "Member health check failed");
                false
            }
            Err(_) => {
                warn!(member = %member.name, endpoint = %url, "Member health check timed out");
                false
            }
        }
    }
}
