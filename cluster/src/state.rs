use crate::membership::MembershipManager;
use cortex_common::{ClusterState, ResourceTotals};
use cortex_consensus::{RaftEvent, RaftNode};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Boundary to the workload layer: capacity currently allocated to running
/// work plus queue depths. The core never schedules anything itself.
pub trait AllocationSource: Send + Sync {
    fn in_use(&self) -> ResourceTotals;
    fn active_tasks(&self) -> u32;
    fn queued_tasks(&self) -> u32;
}

/// Default source for nodes without a workload layer attached.
pub struct NoAllocations;

impl AllocationSource for NoAllocations {
    fn in_use(&self) -> ResourceTotals {
        ResourceTotals::default()
    }

    fn active_tasks(&self) -> u32 {
        0
    }

    fn queued_tasks(&self) -> u32 {
        0
    }
}

/// Cached aggregate view over the roster and the replicated resource
/// snapshots: totals are the sum over active members' last snapshots,
/// available capacity subtracts the workload layer's allocations.
/// Recomputed on every commit.
pub struct ClusterStateView {
    cluster_id: String,
    membership: Arc<MembershipManager>,
    raft: Arc<RaftNode>,
    allocations: Arc<dyn AllocationSource>,
    cache: RwLock<ClusterState>,
    cancel: CancellationToken,
}

impl ClusterStateView {
    pub fn new(
        cluster_id: String,
        membership: Arc<MembershipManager>,
        raft: Arc<RaftNode>,
        allocations: Arc<dyn AllocationSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(ClusterState {
                cluster_id: cluster_id.clone(),
                ..Default::default()
            }),
            cluster_id,
            membership,
            raft,
            allocations,
            cancel: CancellationToken::new(),
        })
    }

    /// Latest cached aggregate.
    pub fn current(&self) -> ClusterState {
        self.cache.read().clone()
    }

    /// Rebuild the aggregate from the committed projections.
    pub async fn recompute(&self) -> ClusterState {
        let consensus = self.raft.state().await;
        let nodes = self.membership.get_all_nodes();

        let mut total = ResourceTotals::default();
        for node in self.membership.get_active_nodes() {
            if let Some(resources) = &node.resources {
                total.cpu_cores += resources.cpu.cores;
                total.memory_bytes += resources.memory.total_bytes;
                total.gpu_count += resources.gpus.len() as u32;
                total.gpu_memory_bytes += resources
                    .gpus
                    .iter()
                    .map(|g| g.memory_total_bytes)
                    .sum::<u64>();
            }
        }

        let in_use = self.allocations.in_use();
        let available = ResourceTotals {
            cpu_cores: total.cpu_cores.saturating_sub(in_use.cpu_cores),
            memory_bytes: total.memory_bytes.saturating_sub(in_use.memory_bytes),
            gpu_count: total.gpu_count.saturating_sub(in_use.gpu_count),
            gpu_memory_bytes: total.gpu_memory_bytes.saturating_sub(in_use.gpu_memory_bytes),
        };

        let state = ClusterState {
            cluster_id: self.cluster_id.clone(),
            leader_id: consensus.leader_id,
            term: consensus.term,
            nodes,
            total_resources: total,
            available_resources: available,
            active_tasks: self.allocations.active_tasks(),
            queued_tasks: self.allocations.queued_tasks(),
        };

        *self.cache.write() = state.clone();
        state
    }

    /// Track commits and leadership changes, refreshing the cache as they
    /// land.
    pub fn start(self: &Arc<Self>) {
        let view = self.clone();
        let mut events = self.raft.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = view.cancel.cancelled() => {
                        debug!("cluster state view stopped");
                        return;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(RaftEvent::Commit { .. })
                            | Ok(RaftEvent::LeaderChange { .. })
                            | Ok(RaftEvent::StateChange { .. }) => {
                                view.recompute().await;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "consensus events lagged; recomputing");
                                view.recompute().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{MembershipChange, NodeReport};
    use cortex_common::config::RaftConfig;
    use cortex_common::{
        now_unix, CortexError, CpuStats, DiskStats, GpuStats, HealthStatus, MemoryStats, NodeId,
        NodeInfo, NodeRole, NodeStatus, ResourceSnapshot, Result,
    };
    use cortex_consensus::{
        AppendEntriesRequest, AppendEntriesResponse, EntryKind, LogEntry, MemoryStore,
        RaftTransport, VoteRequest, VoteResponse,
    };
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct DeadTransport;

    #[async_trait::async_trait]
    impl RaftTransport for DeadTransport {
        async fn request_vote(&self, _: &NodeId, _: VoteRequest) -> Result<VoteResponse> {
            Err(CortexError::transport("unreachable"))
        }

        async fn append_entries(
            &self,
            _: &NodeId,
            _: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            Err(CortexError::transport("unreachable"))
        }
    }

    fn node_with_resources(id: &str, status: NodeStatus, cores: u32, mem: u64, gpus: u32) -> NodeInfo {
        NodeInfo {
            node_id: NodeId(id.into()),
            hostname: id.into(),
            mesh_ip: "100.64.0.1".into(),
            online: true,
            last_seen: now_unix(),
            tags: BTreeSet::new(),
            status,
            role: NodeRole::Voter,
            joined_at: now_unix(),
            resources: Some(ResourceSnapshot {
                timestamp: 1,
                cpu: CpuStats {
                    cores,
                    usage_percent: 10.0,
                    load_avg: [0.0; 3],
                },
                memory: MemoryStats {
                    total_bytes: mem,
                    available_bytes: mem / 2,
                    used_pct: 50.0,
                },
                disk: DiskStats::default(),
                gpus: (0..gpus)
                    .map(|i| GpuStats {
                        index: i,
                        name: "gpu".into(),
                        memory_total_bytes: 8 << 30,
                        memory_free_bytes: 4 << 30,
                        utilization_pct: 5.0,
                        in_use_for_gaming: false,
                    })
                    .collect(),
                gaming_detected: false,
            }),
            grpc_endpoint: "http://100.64.0.1:7400".into(),
        }
    }

    async fn single_node_view() -> (Arc<MembershipManager>, Arc<ClusterStateView>, Arc<cortex_consensus::RaftNode>) {
        let raft = cortex_consensus::RaftNode::new(
            NodeId("local".into()),
            Vec::new(),
            RaftConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(DeadTransport),
        )
        .await
        .unwrap();

        let membership = MembershipManager::new(
            NodeId("local".into()),
            7400,
            Duration::from_secs(45),
            raft.clone(),
        );
        let view = ClusterStateView::new(
            "lab".into(),
            membership.clone(),
            raft.clone(),
            Arc::new(NoAllocations),
        );
        (membership, view, raft)
    }

    #[tokio::test]
    async fn test_totals_sum_only_active_nodes() {
        let (membership, view, _raft) = single_node_view().await;

        let active = node_with_resources("a", NodeStatus::Active, 8, 32 << 30, 1);
        let pending = node_with_resources("b", NodeStatus::Pending, 16, 64 << 30, 2);
        let drained = node_with_resources("c", NodeStatus::Drained, 4, 8 << 30, 0);
        for info in [active, pending, drained] {
            let entry = LogEntry {
                index: 1,
                term: 1,
                kind: EntryKind::Membership,
                payload: bincode::serialize(&MembershipChange::Join(info)).unwrap(),
            };
            membership.apply(&entry);
        }
        // only "a" becomes active
        membership.apply(&LogEntry {
            index: 2,
            term: 1,
            kind: EntryKind::Membership,
            payload: bincode::serialize(&MembershipChange::Approve {
                node_id: NodeId("a".into()),
            })
            .unwrap(),
        });

        let state = view.recompute().await;
        assert_eq!(state.total_resources.cpu_cores, 8);
        assert_eq!(state.total_resources.memory_bytes, 32 << 30);
        assert_eq!(state.total_resources.gpu_count, 1);
        assert_eq!(state.total_resources.gpu_memory_bytes, 8 << 30);
        assert_eq!(state.nodes.len(), 3, "roster lists every known node");
    }

    #[tokio::test]
    async fn test_totals_follow_latest_node_report() {
        let (membership, view, _raft) = single_node_view().await;

        let info = node_with_resources("a", NodeStatus::Active, 8, 32 << 30, 0);
        membership.apply(&LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::Membership,
            payload: bincode::serialize(&MembershipChange::Join(info)).unwrap(),
        });
        membership.apply(&LogEntry {
            index: 2,
            term: 1,
            kind: EntryKind::Membership,
            payload: bincode::serialize(&MembershipChange::Approve {
                node_id: NodeId("a".into()),
            })
            .unwrap(),
        });

        let mut fresh = node_with_resources("a", NodeStatus::Active, 12, 48 << 30, 0)
            .resources
            .unwrap();
        fresh.timestamp = 99;
        membership.apply(&LogEntry {
            index: 3,
            term: 1,
            kind: EntryKind::NodeReport,
            payload: bincode::serialize(&NodeReport {
                node_id: NodeId("a".into()),
                health: HealthStatus {
                    healthy: true,
                    message: "ok".into(),
                    last_check: now_unix(),
                    uptime_seconds: 1,
                    active_tasks: vec![],
                    issues: vec![],
                },
                resources: fresh,
            })
            .unwrap(),
        });

        let state = view.recompute().await;
        assert_eq!(state.total_resources.cpu_cores, 12);
        assert_eq!(state.total_resources.memory_bytes, 48 << 30);
    }
}
