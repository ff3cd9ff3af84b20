use crate::discovery::{DiscoveryEvent, PeerDiscovery};
use crate::transport::EndpointResolver;
use cortex_common::{
    CortexError, HealthStatus, NodeId, NodeInfo, NodeRole, NodeStatus, PeerRecord,
    ResourceSnapshot, Result,
};
use cortex_consensus::{EntryKind, LogEntry, LogPosition, Proposer};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Replicated membership operations; the payload of `Membership` log
/// entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipChange {
    Join(NodeInfo),
    Approve { node_id: NodeId },
    Drain { node_id: NodeId },
    MarkDrained { node_id: NodeId },
    Leave { node_id: NodeId },
    /// Explicit leader-committed regression; the only way a status moves
    /// backwards.
    ResetStatus { node_id: NodeId, status: NodeStatus },
}

/// Payload of `NodeReport` log entries: one node's health and resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub health: HealthStatus,
    pub resources: ResourceSnapshot,
}

/// Authoritative node roster.
///
/// Reads are served from the committed projection; every write goes
/// through a consensus proposal and lands here via the apply loop. The
/// discovery stream is reconciled against the roster: unknown or departed
/// cluster-tagged peers become join proposals, peers offline past the
/// failure grace become drain proposals, and only the leader proposes.
pub struct MembershipManager {
    local_id: NodeId,
    grpc_port: u16,
    failure_grace: Duration,
    proposer: Arc<dyn Proposer>,
    roster: DashMap<NodeId, NodeInfo>,
    offline_since: DashMap<NodeId, Instant>,
    changed: broadcast::Sender<()>,
    cancel: CancellationToken,
}

impl MembershipManager {
    pub fn new(
        local_id: NodeId,
        grpc_port: u16,
        failure_grace: Duration,
        proposer: Arc<dyn Proposer>,
    ) -> Arc<Self> {
        let (changed, _) = broadcast::channel(64);
        Arc::new(Self {
            local_id,
            grpc_port,
            failure_grace,
            proposer,
            roster: DashMap::new(),
            offline_since: DashMap::new(),
            changed,
            cancel: CancellationToken::new(),
        })
    }

    /// Fires whenever a committed entry changed the roster.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }

    // ------------------------------------------------------------------
    // Committed-entry application (runs inside the consensus apply loop)
    // ------------------------------------------------------------------

    pub fn apply(&self, entry: &LogEntry) {
        match entry.kind {
            EntryKind::Membership => match bincode::deserialize::<MembershipChange>(&entry.payload)
            {
                Ok(change) => self.apply_membership(change),
                Err(e) => warn!(index = entry.index, error = %e, "undecodable membership entry"),
            },
            EntryKind::NodeReport => match bincode::deserialize::<NodeReport>(&entry.payload) {
                Ok(report) => self.apply_node_report(report),
                Err(e) => warn!(index = entry.index, error = %e, "undecodable node report"),
            },
            EntryKind::Noop | EntryKind::StateOp => {}
        }
    }

    fn apply_membership(&self, change: MembershipChange) {
        match change {
            MembershipChange::Join(info) => {
                let node_id = info.node_id.clone();
                match self.roster.get(&node_id).map(|n| n.status) {
                    None => {
                        info!(node = %node_id, "node joined (pending approval)");
                        self.roster.insert(node_id, info);
                    }
                    Some(NodeStatus::Gone) => {
                        info!(node = %node_id, "departed node rejoined (pending approval)");
                        self.roster.insert(node_id, info);
                    }
                    Some(status) => {
                        debug!(node = %node_id, %status, "ignoring join for known node");
                        return;
                    }
                }
            }
            MembershipChange::Approve { node_id } => {
                self.transition(&node_id, NodeStatus::Active);
            }
            MembershipChange::Drain { node_id } => {
                self.transition(&node_id, NodeStatus::Draining);
            }
            MembershipChange::MarkDrained { node_id } => {
                self.transition(&node_id, NodeStatus::Drained);
            }
            MembershipChange::Leave { node_id } => {
                self.transition(&node_id, NodeStatus::Gone);
            }
            MembershipChange::ResetStatus { node_id, status } => {
                if let Some(mut node) = self.roster.get_mut(&node_id) {
                    info!(node = %node_id, from = %node.status, to = %status, "status reset");
                    node.status = status;
                } else {
                    warn!(node = %node_id, "status reset for unknown node");
                    return;
                }
            }
        }
        let _ = self.changed.send(());
    }

    /// Monotone transition; anything else is dropped with a warning.
    fn transition(&self, node_id: &NodeId, to: NodeStatus) {
        match self.roster.get_mut(node_id) {
            Some(mut node) => {
                if node.status.can_transition_to(to) {
                    info!(node = %node_id, from = %node.status, to = %to, "membership transition");
                    node.status = to;
                } else {
                    warn!(
                        node = %node_id,
                        from = %node.status,
                        to = %to,
                        "ignoring non-monotone membership transition"
                    );
                }
            }
            None => warn!(node = %node_id, to = %to, "transition for unknown node"),
        }
    }

    /// Coalesce node reports: only a report newer than the stored snapshot
    /// replaces it; stale reports are discarded.
    fn apply_node_report(&self, report: NodeReport) {
        if let Some(mut node) = self.roster.get_mut(&report.node_id) {
            let stored = node.resources.as_ref().map(|r| r.timestamp).unwrap_or(0);
            if report.resources.timestamp < stored {
                debug!(node = %report.node_id, "discarding stale node report");
                return;
            }
            node.resources = Some(report.resources);
            node.online = true;
        } else {
            debug!(node = %report.node_id, "node report for unknown node");
            return;
        }
        let _ = self.changed.send(());
    }

    // ------------------------------------------------------------------
    // Write path (leader-only, via the proposer handle)
    // ------------------------------------------------------------------

    async fn propose_change(&self, change: MembershipChange) -> Result<LogPosition> {
        let payload = bincode::serialize(&change)
            .map_err(|e| CortexError::Serialization(e.to_string()))?;
        self.proposer.propose(EntryKind::Membership, payload).await
    }

    pub async fn join(&self, info: NodeInfo) -> Result<LogPosition> {
        self.propose_change(MembershipChange::Join(info)).await
    }

    pub async fn approve(&self, node_id: NodeId) -> Result<LogPosition> {
        self.propose_change(MembershipChange::Approve { node_id }).await
    }

    pub async fn drain(&self, node_id: NodeId) -> Result<LogPosition> {
        self.propose_change(MembershipChange::Drain { node_id }).await
    }

    /// Call once the drained node's task count has reached zero.
    pub async fn mark_drained(&self, node_id: NodeId) -> Result<LogPosition> {
        self.propose_change(MembershipChange::MarkDrained { node_id })
            .await
    }

    pub async fn leave(&self, node_id: NodeId) -> Result<LogPosition> {
        self.propose_change(MembershipChange::Leave { node_id }).await
    }

    /// Replicate a node's latest health + resources.
    pub async fn update_resources(
        &self,
        node_id: NodeId,
        health: HealthStatus,
        resources: ResourceSnapshot,
    ) -> Result<LogPosition> {
        let report = NodeReport {
            node_id,
            health,
            resources,
        };
        let payload = bincode::serialize(&report)
            .map_err(|e| CortexError::Serialization(e.to_string()))?;
        self.proposer.propose(EntryKind::NodeReport, payload).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_node(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.roster.get(node_id).map(|n| n.clone())
    }

    pub fn get_all_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.roster.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn get_active_nodes(&self) -> Vec<NodeInfo> {
        self.get_all_nodes()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect()
    }

    pub fn get_pending_approvals(&self) -> Vec<NodeInfo> {
        self.get_all_nodes()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Pending)
            .collect()
    }

    /// Voting peers for the consensus layer: active or draining voters,
    /// excluding ourselves.
    pub fn voter_peers(&self) -> Vec<NodeId> {
        self.get_all_nodes()
            .into_iter()
            .filter(|n| {
                n.role == NodeRole::Voter
                    && matches!(n.status, NodeStatus::Active | NodeStatus::Draining)
                    && n.node_id != self.local_id
            })
            .map(|n| n.node_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Discovery reconciliation
    // ------------------------------------------------------------------

    pub fn start(self: &Arc<Self>, discovery: &Arc<PeerDiscovery>) {
        let manager = self.clone();
        let mut events = discovery.subscribe();
        tokio::spawn(async move {
            let mut grace_ticker =
                tokio::time::interval(manager.failure_grace.max(Duration::from_secs(1)) / 2);
            grace_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => {
                        debug!("membership reconciler stopped");
                        return;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => manager.handle_discovery_event(&event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "discovery events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = grace_ticker.tick() => {
                        manager.check_failure_grace().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn handle_discovery_event(&self, event: &DiscoveryEvent) {
        match event {
            DiscoveryEvent::NodeDiscovered(peer) => {
                self.note_peer_seen(peer);
                let known = self
                    .roster
                    .get(&peer.node_id)
                    .map(|n| n.status)
                    .filter(|s| *s != NodeStatus::Gone)
                    .is_some();
                if !known && self.proposer.is_leader().await {
                    let info = NodeInfo::from_peer(
                        peer,
                        NodeRole::Voter,
                        format!("http://{}:{}", peer.mesh_ip, self.grpc_port),
                    );
                    info!(node = %peer.node_id, "proposing join for discovered peer");
                    if let Err(e) = self.join(info).await {
                        warn!(node = %peer.node_id, error = %e, "join proposal failed");
                    }
                }
            }
            DiscoveryEvent::NodeOnline(id) => {
                self.offline_since.remove(id);
                if let Some(mut node) = self.roster.get_mut(id) {
                    node.online = true;
                }
            }
            DiscoveryEvent::NodeOffline(id) | DiscoveryEvent::NodeRemoved(id) => {
                if let Some(mut node) = self.roster.get_mut(id) {
                    node.online = false;
                }
                self.offline_since.entry(id.clone()).or_insert_with(Instant::now);
            }
            DiscoveryEvent::Error(_) => {}
        }
    }

    fn note_peer_seen(&self, peer: &PeerRecord) {
        if let Some(mut node) = self.roster.get_mut(&peer.node_id) {
            node.hostname = peer.hostname.clone();
            node.mesh_ip = peer.mesh_ip.clone();
            node.online = peer.online;
            node.last_seen = peer.last_seen;
            node.tags = peer.tags.clone();
        }
        if peer.online {
            self.offline_since.remove(&peer.node_id);
        }
    }

    /// Active members offline for longer than the grace window get a drain
    /// proposal (leader only).
    pub async fn check_failure_grace(&self) {
        if !self.proposer.is_leader().await {
            return;
        }
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .offline_since
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) >= self.failure_grace)
            .map(|entry| entry.key().clone())
            .collect();

        for node_id in expired {
            let is_active = self
                .roster
                .get(&node_id)
                .map(|n| n.status == NodeStatus::Active)
                .unwrap_or(false);
            if !is_active {
                self.offline_since.remove(&node_id);
                continue;
            }
            warn!(node = %node_id, "offline past failure grace; proposing drain");
            match self.drain(node_id.clone()).await {
                Ok(_) => {
                    self.offline_since.remove(&node_id);
                }
                Err(e) => warn!(node = %node_id, error = %e, "drain proposal failed"),
            }
        }
    }
}

impl EndpointResolver for MembershipManager {
    fn endpoint_of(&self, node: &NodeId) -> Option<String> {
        self.roster.get(node).map(|n| n.grpc_endpoint.clone())
    }
}
