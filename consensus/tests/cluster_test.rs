//! Multi-node consensus scenarios over an in-memory transport with a
//! paused clock.

use cortex_common::config::RaftConfig;
use cortex_common::{CortexError, NodeId, Result};
use cortex_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, EntryKind, MemoryStore, RaftNode, RaftRole,
    RaftTransport, VoteRequest, VoteResponse,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Routes RPCs directly into peer nodes; nodes marked down drop traffic in
/// both directions, which doubles as a partition switch.
#[derive(Default)]
struct Network {
    nodes: Mutex<HashMap<NodeId, Arc<RaftNode>>>,
    down: Mutex<HashSet<NodeId>>,
}

impl Network {
    fn set_down(&self, id: &NodeId) {
        self.down.lock().insert(id.clone());
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        let down = self.down.lock();
        !down.contains(from) && !down.contains(to)
    }

    fn node(&self, id: &NodeId) -> Option<Arc<RaftNode>> {
        self.nodes.lock().get(id).cloned()
    }
}

struct NetTransport {
    network: Arc<Network>,
    from: NodeId,
}

#[async_trait::async_trait]
impl RaftTransport for NetTransport {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        if !self.network.reachable(&self.from, target) {
            return Err(CortexError::transport("partitioned"));
        }
        match self.network.node(target) {
            Some(node) => Ok(node.handle_request_vote(request).await),
            None => Err(CortexError::transport("no such node")),
        }
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if !self.network.reachable(&self.from, target) {
            return Err(CortexError::transport("partitioned"));
        }
        match self.network.node(target) {
            Some(node) => Ok(node.handle_append_entries(request).await),
            None => Err(CortexError::transport("no such node")),
        }
    }
}

async fn build_cluster(ids: &[&str]) -> (Arc<Network>, Vec<Arc<RaftNode>>) {
    let network = Arc::new(Network::default());
    let mut nodes = Vec::new();

    for id in ids {
        let node_id = NodeId(id.to_string());
        let peers: Vec<NodeId> = ids
            .iter()
            .filter(|other| *other != id)
            .map(|other| NodeId(other.to_string()))
            .collect();
        let transport = Arc::new(NetTransport {
            network: network.clone(),
            from: node_id.clone(),
        });
        let node = RaftNode::new(
            node_id.clone(),
            peers,
            RaftConfig::default(),
            Arc::new(MemoryStore::new()),
            transport,
        )
        .await
        .unwrap();
        network.nodes.lock().insert(node_id, node.clone());
        nodes.push(node);
    }

    for node in &nodes {
        node.start().await;
    }
    (network, nodes)
}

async fn leaders_of(nodes: &[Arc<RaftNode>]) -> Vec<Arc<RaftNode>> {
    let mut leaders = Vec::new();
    for node in nodes {
        if node.is_leader().await {
            leaders.push(node.clone());
        }
    }
    leaders
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_elects_exactly_one_leader() {
    let (_network, nodes) = build_cluster(&["a", "b", "c"]).await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let leaders = leaders_of(&nodes).await;
    assert_eq!(leaders.len(), 1, "exactly one leader by 600ms");
    let leader = &leaders[0];
    assert_eq!(leader.current_term().await, 1);

    for node in &nodes {
        assert_eq!(
            node.leader().await.as_ref(),
            Some(leader.id()),
            "everyone agrees on the leader"
        );
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_leader_failover_within_two_timeouts() {
    let (network, nodes) = build_cluster(&["a", "b", "c"]).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    let leaders = leaders_of(&nodes).await;
    assert_eq!(leaders.len(), 1);
    let old_leader = leaders[0].clone();
    let old_term = old_leader.current_term().await;

    // kill the leader at t=1s
    tokio::time::sleep(Duration::from_millis(400)).await;
    network.set_down(old_leader.id());
    old_leader.stop().await;

    // by t=1.6s a survivor must lead at a higher term
    tokio::time::sleep(Duration::from_millis(600)).await;

    let survivors: Vec<_> = nodes
        .iter()
        .filter(|n| n.id() != old_leader.id())
        .cloned()
        .collect();
    let new_leaders = leaders_of(&survivors).await;
    assert_eq!(new_leaders.len(), 1, "a survivor took over");
    assert!(new_leaders[0].current_term().await > old_term);

    for node in &survivors {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_node_cluster_makes_no_progress_alone() {
    let (network, nodes) = build_cluster(&["a", "b"]).await;

    // partition b away from the start
    network.set_down(nodes[1].id());
    nodes[1].stop().await;

    tokio::time::sleep(Duration::from_millis(2_000)).await;

    // quorum is 2: a must not declare leadership alone
    assert!(!nodes[0].is_leader().await);
    let state = nodes[0].state().await;
    assert_eq!(state.commit_index, 0, "no commit progress without quorum");

    nodes[0].stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_proposals_replicate_and_commit_everywhere() {
    let (_network, nodes) = build_cluster(&["a", "b", "c"]).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    let leader = leaders_of(&nodes).await.remove(0);

    let mut last = 0;
    for payload in [&b"one"[..], b"two", b"three"] {
        let pos = leader
            .propose(EntryKind::StateOp, payload.to_vec())
            .await
            .unwrap();
        last = pos.index;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in &nodes {
        let state = node.state().await;
        assert!(
            state.commit_index >= last,
            "node {} commit {} < {}",
            node.id(),
            state.commit_index,
            last
        );
        assert!(state.last_applied <= state.commit_index);
        assert!(state.commit_index <= state.last_log_index);
    }

    // committed prefixes agree on every (index, term, payload)
    let mut committed_prefixes = Vec::new();
    for node in &nodes {
        let commit = node.state().await.commit_index;
        committed_prefixes.push(node.log_range(1, commit.min(last)).await);
    }
    assert!(
        committed_prefixes.windows(2).all(|w| w[0] == w[1]),
        "committed logs diverged"
    );

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_commit_index_is_monotone_per_node() {
    let (_network, nodes) = build_cluster(&["a", "b", "c"]).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    let leader = leaders_of(&nodes).await.remove(0);

    let mut previous = vec![0u64; nodes.len()];
    for round in 0..5 {
        leader
            .propose(EntryKind::StateOp, format!("round-{round}").into_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        for (i, node) in nodes.iter().enumerate() {
            let commit = node.state().await.commit_index;
            assert!(commit >= previous[i], "commit index regressed");
            previous[i] = commit;
        }
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_leadership_transfer_hands_off_to_target() {
    let (_network, nodes) = build_cluster(&["a", "b", "c"]).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    let leader = leaders_of(&nodes).await.remove(0);

    let target = nodes
        .iter()
        .find(|n| n.id() != leader.id())
        .unwrap()
        .clone();

    let outcome = leader
        .transfer_leadership(Some(target.id().clone()))
        .await
        .unwrap();
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(leader.role().await, RaftRole::Follower);

    // the hinted node should win the follow-up election
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(target.is_leader().await);

    for node in &nodes {
        node.stop().await;
    }
}
