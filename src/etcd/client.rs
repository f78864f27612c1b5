//! Minimal etcd v3 client.
//!
//! Only the two RPCs the health validator needs are declared:
//! `etcdserverpb.Cluster/MemberList` and `etcdserverpb.KV/Range`. Messages are
//! hand-declared prost structs carrying just the fields read here; unknown
//! fields on the wire are skipped by prost.

use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, warn};

const MEMBER_LIST_PATH: &str = "/etcdserverpb.Cluster/MemberList";
const RANGE_PATH: &str = "/etcdserverpb.KV/Range";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseHeader {
    #[prost(uint64, tag = "1")]
    pub cluster_id: u64,
    /// ID of the member that served the request.
    #[prost(uint64, tag = "2")]
    pub member_id: u64,
    #[prost(int64, tag = "3")]
    pub revision: i64,
    #[prost(uint64, tag = "4")]
    pub raft_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Member {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, repeated, tag = "3")]
    pub peer_urls: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub client_urls: Vec<String>,
    #[prost(bool, tag = "5")]
    pub is_learner: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberListRequest {
    #[prost(bool, tag = "1")]
    pub linearizable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberListResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
    #[prost(message, repeated, tag = "2")]
    pub members: Vec<Member>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RangeRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub range_end: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub limit: i64,
    #[prost(bool, tag = "7")]
    pub serializable: bool,
    #[prost(bool, tag = "8")]
    pub keys_only: bool,
    #[prost(bool, tag = "9")]
    pub count_only: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RangeResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
    #[prost(bool, tag = "3")]
    pub more: bool,
    #[prost(int64, tag = "4")]
    pub count: i64,
}

/// Errors from dialing or calling an etcd member.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("no endpoint reachable within {timeout:?}: {last_error}")]
    Unreachable {
        timeout: Duration,
        last_error: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Connected etcd client.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn member_list(&self) -> Result<MemberListResponse, ClientError>;

    /// Single-key read used as a liveness probe.
    async fn get(&self, key: &str) -> Result<RangeResponse, ClientError>;
}

/// Opens clients against an endpoint set.
#[async_trait]
pub trait ClusterDialer: Send + Sync {
    /// Connect to the first endpoint in `endpoints` that accepts a connection.
    async fn dial(&self, endpoints: &[String]) -> Result<Box<dyn ClusterClient>, ClientError>;
}

/// Client over a single tonic channel.
#[derive(Clone)]
pub struct GrpcClusterClient {
    channel: Channel,
}

impl GrpcClusterClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, ClientError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl ClusterClient for GrpcClusterClient {
    async fn member_list(&self) -> Result<MemberListResponse, ClientError> {
        self.unary(
            MEMBER_LIST_PATH,
            MemberListRequest { linearizable: true },
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<RangeResponse, ClientError> {
        let request = RangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        };
        self.unary(RANGE_PATH, request).await
    }
}

/// Render `err` followed by each of its sources, `: `-separated.
///
/// tonic transport errors display only their kind; the cause is in the chain.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Dials etcd over gRPC, optionally with mutual TLS.
#[derive(Clone)]
pub struct GrpcClusterDialer {
    tls: Option<ClientTlsConfig>,
    dial_timeout: Duration,
}

impl GrpcClusterDialer {
    pub fn new(tls: Option<ClientTlsConfig>, dial_timeout: Duration) -> Self {
        Self { tls, dial_timeout }
    }

    fn endpoint(&self, url: &str) -> Result<Endpoint, ClientError> {
        let mut endpoint =
            Endpoint::from_shared(url.to_string()).map_err(|e| ClientError::InvalidEndpoint {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }
        Ok(endpoint
            .connect_timeout(self.dial_timeout)
            .timeout(self.dial_timeout))
    }
}

#[async_trait]
impl ClusterDialer for GrpcClusterDialer {
    async fn dial(&self, endpoints: &[String]) -> Result<Box<dyn ClusterClient>, ClientError> {
        let mut last_error = String::from("no endpoints");

        for url in endpoints {
            let endpoint = self.endpoint(url)?;
            match tokio::time::timeout(self.dial_timeout, endpoint.connect()).await {
                Ok(Ok(channel)) => {
                    debug!(endpoint = %url, "Connected to etcd");
                    return Ok(Box::new(GrpcClusterClient::new(channel)));
                }
                Ok(Err(e)) => {
                    let cause = error_chain(&e);
                    warn!(endpoint = %url, error = %cause, "etcd dial failed");
                    last_error = format!("{}: {}", url, cause);
                }
                Err(_) => {
                    warn!(endpoint = %url, timeout = ?self.dial_timeout, "etcd dial timed out");
                    last_error = format!("{} timed out", url);
                }
            }
        }

        Err(ClientError::Unreachable {
            timeout: self.dial_timeout,
            last_error,
        })
    }
}
