use cortex_common::config::TransportConfig;
use cortex_common::{CortexError, NodeId, Result};
use cortex_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, EntryKind, LogEntry, RaftTransport, VoteRequest,
    VoteResponse,
};
use cortex_proto::raft_service_client::RaftServiceClient;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, warn};

/// Pooled peer-RPC channels: lazily connected, at most one per endpoint,
/// keepalive-pinged, with the cluster-wide message-size caps applied to
/// every client built from them.
pub struct PeerTransport {
    config: TransportConfig,
    channels: DashMap<String, Channel>,
    tls: Option<ClientTlsConfig>,
}

impl PeerTransport {
    pub async fn new(config: TransportConfig) -> Result<Arc<Self>> {
        let tls = match &config.tls {
            Some(tls_config) => {
                let ca = tokio::fs::read(&tls_config.ca_cert_path).await?;
                let cert = tokio::fs::read(&tls_config.cert_path).await?;
                let key = tokio::fs::read(&tls_config.key_path).await?;
                Some(
                    ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(ca))
                        .identity(Identity::from_pem(cert, key))
                        .domain_name(tls_config.domain.clone()),
                )
            }
            None => None,
        };

        Ok(Arc::new(Self {
            config,
            channels: DashMap::new(),
            tls,
        }))
    }

    fn endpoint(&self, uri: &str) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(uri.to_string())
            .map_err(|e| CortexError::transport(format!("invalid endpoint {uri}: {e}")))?
            .http2_keep_alive_interval(Duration::from_millis(self.config.keepalive_interval_ms))
            .keep_alive_timeout(Duration::from_millis(self.config.keepalive_timeout_ms))
            .keep_alive_while_idle(true)
            .connect_timeout(Duration::from_millis(self.config.call_timeout_ms));

        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| CortexError::transport(format!("tls config: {e}")))?;
        }
        Ok(endpoint)
    }

    /// Channel for `uri`, created lazily on first use.
    pub fn connection(&self, uri: &str) -> Result<Channel> {
        if let Some(existing) = self.channels.get(uri) {
            return Ok(existing.clone());
        }
        let channel = self.endpoint(uri)?.connect_lazy();
        self.channels.insert(uri.to_string(), channel.clone());
        Ok(channel)
    }

    /// Probe an endpoint by completing a real connection within `timeout`.
    pub async fn wait_for_ready(&self, uri: &str, timeout: Duration) -> bool {
        let endpoint = match self.endpoint(uri) {
            Ok(e) => e,
            Err(_) => return false,
        };
        match tokio::time::timeout(timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => {
                self.channels.insert(uri.to_string(), channel);
                true
            }
            Ok(Err(e)) => {
                debug!(endpoint = uri, error = %e, "endpoint not ready");
                false
            }
            Err(_) => false,
        }
    }

    pub fn close_all(&self) {
        self.channels.clear();
    }

    /// Drop a pooled channel (e.g. after repeated failures) so the next
    /// call reconnects.
    pub fn evict(&self, uri: &str) {
        self.channels.remove(uri);
    }

    pub fn max_message_bytes(&self) -> usize {
        self.config.max_message_bytes
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }
}

/// Maps a node id to its advertised gRPC endpoint; implemented by the
/// membership roster.
pub trait EndpointResolver: Send + Sync {
    fn endpoint_of(&self, node: &NodeId) -> Option<String>;
}

/// Resolver that is wired after construction.
///
/// Consensus needs a transport (which resolves endpoints through the
/// roster) before the roster exists, because the roster proposes through
/// consensus. The daemon builds consensus against this placeholder and
/// binds the membership manager into it one step later.
#[derive(Default)]
pub struct LateBoundResolver {
    inner: std::sync::OnceLock<Arc<dyn EndpointResolver>>,
}

impl LateBoundResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, resolver: Arc<dyn EndpointResolver>) {
        if self.inner.set(resolver).is_err() {
            warn!("endpoint resolver already bound");
        }
    }
}

impl EndpointResolver for LateBoundResolver {
    fn endpoint_of(&self, node: &NodeId) -> Option<String> {
        self.inner.get().and_then(|r| r.endpoint_of(node))
    }
}

// ---------------------------------------------------------------------------
// Wire conversions for the consensus RPCs
// ---------------------------------------------------------------------------

fn kind_to_proto(kind: EntryKind) -> cortex_proto::LogKind {
    match kind {
        EntryKind::Noop => cortex_proto::LogKind::Noop,
        EntryKind::Membership => cortex_proto::LogKind::Membership,
        EntryKind::NodeReport => cortex_proto::LogKind::NodeReport,
        EntryKind::StateOp => cortex_proto::LogKind::StateOp,
    }
}

fn kind_from_proto(kind: i32) -> EntryKind {
    match cortex_proto::LogKind::try_from(kind) {
        Ok(cortex_proto::LogKind::Membership) => EntryKind::Membership,
        Ok(cortex_proto::LogKind::NodeReport) => EntryKind::NodeReport,
        Ok(cortex_proto::LogKind::StateOp) => EntryKind::StateOp,
        _ => EntryKind::Noop,
    }
}

pub fn entry_to_proto(entry: &LogEntry) -> cortex_proto::LogEntry {
    cortex_proto::LogEntry {
        index: entry.index,
        term: entry.term,
        kind: kind_to_proto(entry.kind) as i32,
        payload: entry.payload.clone(),
    }
}

pub fn entry_from_proto(entry: &cortex_proto::LogEntry) -> LogEntry {
    LogEntry {
        index: entry.index,
        term: entry.term,
        kind: kind_from_proto(entry.kind),
        payload: entry.payload.clone(),
    }
}

pub fn append_request_to_proto(request: &AppendEntriesRequest) -> cortex_proto::AppendEntriesRequest {
    cortex_proto::AppendEntriesRequest {
        term: request.term,
        leader_id: request.leader_id.to_string(),
        prev_log_index: request.prev_log_index,
        prev_log_term: request.prev_log_term,
        entries: request.entries.iter().map(entry_to_proto).collect(),
        leader_commit: request.leader_commit,
        timeout_now: request.timeout_now,
    }
}

pub fn append_request_from_proto(proto: &cortex_proto::AppendEntriesRequest) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term: proto.term,
        leader_id: NodeId(proto.leader_id.clone()),
        prev_log_index: proto.prev_log_index,
        prev_log_term: proto.prev_log_term,
        entries: proto.entries.iter().map(entry_from_proto).collect(),
        leader_commit: proto.leader_commit,
        timeout_now: proto.timeout_now,
    }
}

pub fn vote_request_to_proto(request: &VoteRequest) -> cortex_proto::VoteRequest {
    cortex_proto::VoteRequest {
        term: request.term,
        candidate_id: request.candidate_id.to_string(),
        last_log_index: request.last_log_index,
        last_log_term: request.last_log_term,
    }
}

pub fn vote_request_from_proto(proto: &cortex_proto::VoteRequest) -> VoteRequest {
    VoteRequest {
        term: proto.term,
        candidate_id: NodeId(proto.candidate_id.clone()),
        last_log_index: proto.last_log_index,
        last_log_term: proto.last_log_term,
    }
}

/// Consensus transport over the pooled gRPC channels. Peer endpoints come
/// from the membership roster through the resolver seam.
pub struct GrpcRaftTransport {
    transport: Arc<PeerTransport>,
    resolver: Arc<dyn EndpointResolver>,
}

impl GrpcRaftTransport {
    pub fn new(transport: Arc<PeerTransport>, resolver: Arc<dyn EndpointResolver>) -> Self {
        Self {
            transport,
            resolver,
        }
    }

    fn client(&self, target: &NodeId) -> Result<(RaftServiceClient<Channel>, String)> {
        let endpoint = self.resolver.endpoint_of(target).ok_or_else(|| {
            CortexError::transport(format!("no known endpoint for node {target}"))
        })?;
        let channel = self.transport.connection(&endpoint)?;
        let limit = self.transport.max_message_bytes();
        let client = RaftServiceClient::new(channel)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
        Ok((client, endpoint))
    }
}

#[async_trait::async_trait]
impl RaftTransport for GrpcRaftTransport {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        let (mut client, endpoint) = self.client(target)?;
        let response = client
            .request_vote(tonic::Request::new(vote_request_to_proto(&request)))
            .await
            .map_err(|status| {
                warn!(peer = %target, %endpoint, code = ?status.code(), "vote rpc failed");
                CortexError::transport(format!("request_vote to {target}: {status}"))
            })?
            .into_inner();
        Ok(VoteResponse {
            term: response.term,
            vote_granted: response.vote_granted,
        })
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (mut client, endpoint) = self.client(target)?;
        let response = client
            .append_entries(tonic::Request::new(append_request_to_proto(&request)))
            .await
            .map_err(|status| {
                debug!(peer = %target, %endpoint, code = ?status.code(), "append rpc failed");
                CortexError::transport(format!("append_entries to {target}: {status}"))
            })?
            .into_inner();
        Ok(AppendEntriesResponse {
            term: response.term,
            success: response.success,
            conflict_index: response.conflict_index,
            conflict_term: response.conflict_term,
        })
    }
}
