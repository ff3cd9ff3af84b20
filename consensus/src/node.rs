use crate::log::{EntryKind, LogEntry, RaftLog};
use crate::proposer::{LogPosition, Proposer};
use crate::store::RaftStore;
use cortex_common::config::RaftConfig;
use cortex_common::{CortexError, NodeId, Result};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consensus role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    /// Leadership transfer: the addressed follower should start an election
    /// immediately instead of waiting out its timer.
    pub timeout_now: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Hint for the leader's walk-back when the consistency check failed
    pub conflict_index: Option<u64>,
    pub conflict_term: Option<u64>,
}

/// Result of a leadership-transfer attempt. Best effort: the election still
/// picks the winner, so callers re-read state afterwards.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub success: bool,
    pub message: String,
}

/// Events observed by the activation controller, membership, and the MCP
/// surface. Commit events are delivered in strict index order.
#[derive(Debug, Clone)]
pub enum RaftEvent {
    StateChange { role: RaftRole, term: u64 },
    LeaderChange { leader_id: Option<NodeId> },
    Commit { entry: LogEntry },
}

/// Peer-RPC seam. The production implementation lives in the cluster crate
/// (pooled gRPC channels); tests wire nodes together in memory.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Applied-entry callback; runs inside the consensus critical section so
/// the roster and cluster-state projections update in commit order.
pub type Applier = Box<dyn Fn(&LogEntry) + Send + Sync>;

/// Read-only snapshot of the consensus state for diagnostics and the MCP
/// surface.
#[derive(Debug, Clone)]
pub struct RaftStateView {
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

struct RaftCore {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    peers: Vec<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    votes_received: HashSet<NodeId>,
    inflight: HashSet<NodeId>,
    election_deadline: Instant,
    shutdown: bool,
}

impl RaftCore {
    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

/// Replicated-log consensus node.
///
/// The core state is the only mutable shared state here and sits behind a
/// single mutex: every RPC handler and client operation enters that one
/// critical section, and the committed-entry appliers run inside it too,
/// which is what keeps roster updates in strict commit order.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    core: Mutex<RaftCore>,
    store: Arc<dyn RaftStore>,
    transport: Arc<dyn RaftTransport>,
    events: broadcast::Sender<RaftEvent>,
    appliers: parking_lot::RwLock<Vec<Applier>>,
    timer_reset: Notify,
    replicate_kick: Notify,
    cancel: CancellationToken,
}

impl RaftNode {
    /// Restore durable state and build the node. `start` arms the timers.
    pub async fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        store: Arc<dyn RaftStore>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>> {
        let persisted = store.load_state().await?;
        let log = RaftLog::from_entries(persisted.entries);

        let (events, _) = broadcast::channel(256);

        let node = Arc::new(Self {
            core: Mutex::new(RaftCore {
                role: RaftRole::Follower,
                current_term: persisted.current_term,
                voted_for: persisted.voted_for,
                log,
                commit_index: 0,
                last_applied: 0,
                leader_id: None,
                peers,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                votes_received: HashSet::new(),
                inflight: HashSet::new(),
                election_deadline: Instant::now(),
                shutdown: false,
            }),
            id,
            config,
            store,
            transport,
            events,
            appliers: parking_lot::RwLock::new(Vec::new()),
            timer_reset: Notify::new(),
            replicate_kick: Notify::new(),
            cancel: CancellationToken::new(),
        });

        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.events.subscribe()
    }

    /// Register a committed-entry handler. Register before `start` so log
    /// replay after restart is observed from the first commit.
    pub fn register_applier(&self, applier: Applier) {
        self.appliers.write().push(applier);
    }

    /// Arm the election timer and the replication driver.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut core = self.core.lock().await;
            self.reset_election_timer(&mut core);
        }
        self.spawn_election_timer();
        self.spawn_replicator();
        info!(node = %self.id, "consensus node started");
    }

    /// Cancel timers; subsequent proposals fail with `Shutdown`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut core = self.core.lock().await;
        core.shutdown = true;
        info!(node = %self.id, "consensus node stopped");
    }

    /// Replace the voting peer set (membership changes).
    pub async fn set_peers(&self, peers: Vec<NodeId>) {
        let mut core = self.core.lock().await;
        let last = core.log.last_index();
        core.next_index.retain(|p, _| peers.contains(p));
        core.match_index.retain(|p, _| peers.contains(p));
        for peer in &peers {
            core.next_index.entry(peer.clone()).or_insert(last + 1);
            core.match_index.entry(peer.clone()).or_insert(0);
        }
        core.peers = peers;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub async fn state(&self) -> RaftStateView {
        let core = self.core.lock().await;
        RaftStateView {
            role: core.role,
            term: core.current_term,
            leader_id: core.leader_id.clone(),
            commit_index: core.commit_index,
            last_applied: core.last_applied,
            last_log_index: core.log.last_index(),
        }
    }

    pub async fn role(&self) -> RaftRole {
        self.core.lock().await.role
    }

    pub async fn current_term(&self) -> u64 {
        self.core.lock().await.current_term
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.core.lock().await.leader_id.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.core.lock().await.role == RaftRole::Leader
    }

    pub async fn last_log_index(&self) -> u64 {
        self.core.lock().await.log.last_index()
    }

    pub async fn last_log_term(&self) -> u64 {
        self.core.lock().await.log.last_term()
    }

    /// Copy of the log entries in `[from, to]`, for diagnostics and tests.
    pub async fn log_range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        self.core.lock().await.log.range(from, to)
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    /// Append a new entry as leader and begin replication. Returns the
    /// position the entry will commit at if this leadership survives.
    pub async fn propose(&self, kind: EntryKind, payload: Vec<u8>) -> Result<LogPosition> {
        let mut core = self.core.lock().await;
        if core.shutdown {
            return Err(CortexError::Shutdown);
        }
        if core.role != RaftRole::Leader {
            return Err(CortexError::NotLeader {
                leader_hint: core.leader_id.clone(),
            });
        }

        let entry = LogEntry {
            index: core.log.last_index() + 1,
            term: core.current_term,
            kind,
            payload,
        };
        core.log.append(entry.clone())?;
        self.store.append_entries(&[entry.clone()]).await?;

        // A single-node cluster commits on its own majority
        self.advance_commit(&mut core);
        self.replicate_kick.notify_one();

        Ok(LogPosition {
            index: entry.index,
            term: entry.term,
        })
    }

    /// Hand leadership off, preferring `target` when given. The follower is
    /// first caught up to our last log index, then told to start an
    /// election immediately; we step down either way once the hand-off is
    /// sent.
    pub async fn transfer_leadership(&self, target: Option<NodeId>) -> Result<TransferOutcome> {
        let (term, target, last_index) = {
            let core = self.core.lock().await;
            if core.shutdown {
                return Err(CortexError::Shutdown);
            }
            if core.role != RaftRole::Leader {
                return Err(CortexError::NotLeader {
                    leader_hint: core.leader_id.clone(),
                });
            }
            let target = match target {
                Some(t) => {
                    if !core.peers.contains(&t) {
                        return Ok(TransferOutcome {
                            success: false,
                            message: format!("unknown transfer target {t}"),
                        });
                    }
                    t
                }
                // Pick the most caught-up follower
                None => match core
                    .peers
                    .iter()
                    .max_by_key(|p| core.match_index.get(*p).copied().unwrap_or(0))
                {
                    Some(t) => t.clone(),
                    None => {
                        return Ok(TransferOutcome {
                            success: false,
                            message: "single-node cluster has no transfer target".to_string(),
                        })
                    }
                },
            };
            (core.current_term, target, core.log.last_index())
        };

        // Catch-up phase: let the replication driver bring the target to our
        // last index, bounded by two election timeouts.
        let deadline = Instant::now()
            + Duration::from_millis(self.config.election_timeout_max_ms * 2);
        loop {
            {
                let core = self.core.lock().await;
                if core.role != RaftRole::Leader || core.current_term != term {
                    return Ok(TransferOutcome {
                        success: false,
                        message: "leadership lost during transfer".to_string(),
                    });
                }
                if core.match_index.get(&target).copied().unwrap_or(0) >= last_index {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Ok(TransferOutcome {
                    success: false,
                    message: format!("transfer target {target} did not catch up"),
                });
            }
            self.replicate_kick.notify_one();
            tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)).await;
        }

        // Tell the target to elect itself now
        let request = {
            let core = self.core.lock().await;
            AppendEntriesRequest {
                term: core.current_term,
                leader_id: self.id.clone(),
                prev_log_index: core.log.last_index(),
                prev_log_term: core.log.last_term(),
                entries: Vec::new(),
                leader_commit: core.commit_index,
                timeout_now: true,
            }
        };
        let rpc_timeout = Duration::from_millis(self.config.append_rpc_timeout_ms());
        if let Err(e) = tokio::time::timeout(
            rpc_timeout,
            self.transport.append_entries(&target, request),
        )
        .await
        .map_err(|_| CortexError::Timeout)
        .and_then(|r| r)
        {
            warn!(target = %target, error = %e, "timeout-now signal failed");
        }

        // Step down; the target's election will raise the term past ours
        {
            let mut core = self.core.lock().await;
            if core.role == RaftRole::Leader && core.current_term == term {
                self.become_follower_same_term(&mut core);
            }
        }

        info!(target = %target, "stepped down for leadership transfer");
        Ok(TransferOutcome {
            success: true,
            message: format!("stepped down; hinted {target} to take over"),
        })
    }

    // ------------------------------------------------------------------
    // RPC handlers
    // ------------------------------------------------------------------

    pub async fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut core = self.core.lock().await;

        if request.term > core.current_term {
            self.observe_higher_term(&mut core, request.term).await;
        }

        let mut granted = false;
        if request.term == core.current_term {
            let can_vote = match &core.voted_for {
                None => true,
                Some(v) => *v == request.candidate_id,
            };
            let up_to_date = request.last_log_term > core.log.last_term()
                || (request.last_log_term == core.log.last_term()
                    && request.last_log_index >= core.log.last_index());

            if can_vote && up_to_date {
                granted = true;
                if core.voted_for.as_ref() != Some(&request.candidate_id) {
                    core.voted_for = Some(request.candidate_id.clone());
                    if let Err(e) = self.store.save_vote(core.voted_for.clone()).await {
                        error!(error = %e, "failed to persist vote; denying");
                        core.voted_for = None;
                        granted = false;
                    }
                }
                if granted {
                    debug!(candidate = %request.candidate_id, term = request.term, "vote granted");
                    self.reset_election_timer(&mut core);
                }
            }
        }

        VoteResponse {
            term: core.current_term,
            vote_granted: granted,
        }
    }

    pub async fn handle_append_entries(
        self: &Arc<Self>,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let mut core = self.core.lock().await;

        if request.term > core.current_term {
            self.observe_higher_term(&mut core, request.term).await;
        }

        if request.term < core.current_term {
            return AppendEntriesResponse {
                term: core.current_term,
                success: false,
                conflict_index: None,
                conflict_term: None,
            };
        }

        // A current-term AppendEntries settles who leads this term
        if core.role != RaftRole::Follower {
            self.become_follower_same_term(&mut core);
        }
        if core.leader_id.as_ref() != Some(&request.leader_id) {
            core.leader_id = Some(request.leader_id.clone());
            let _ = self.events.send(RaftEvent::LeaderChange {
                leader_id: core.leader_id.clone(),
            });
        }
        self.reset_election_timer(&mut core);

        // Log-matching consistency check
        if request.prev_log_index > 0 {
            match core.log.term_at(request.prev_log_index) {
                None => {
                    // Our log is short; point the leader at our end
                    return AppendEntriesResponse {
                        term: core.current_term,
                        success: false,
                        conflict_index: Some(core.log.last_index() + 1),
                        conflict_term: None,
                    };
                }
                Some(term) if term != request.prev_log_term => {
                    // Conflicting history; walk the leader back to our
                    // committed point so the next request can succeed
                    return AppendEntriesResponse {
                        term: core.current_term,
                        success: false,
                        conflict_index: Some(core.commit_index + 1),
                        conflict_term: Some(term),
                    };
                }
                _ => {}
            }
        }

        // Append, overwriting any conflicting uncommitted suffix
        let mut fresh = Vec::new();
        for entry in &request.entries {
            match core.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= core.commit_index {
                        error!(
                            index = entry.index,
                            commit = core.commit_index,
                            "refusing to overwrite a committed entry"
                        );
                        return AppendEntriesResponse {
                            term: core.current_term,
                            success: false,
                            conflict_index: None,
                            conflict_term: None,
                        };
                    }
                    core.log.truncate_from(entry.index);
                    if let Err(e) = self.store.truncate_suffix(entry.index).await {
                        error!(error = %e, "log truncate failed");
                        return AppendEntriesResponse {
                            term: core.current_term,
                            success: false,
                            conflict_index: None,
                            conflict_term: None,
                        };
                    }
                    if core.log.append(entry.clone()).is_ok() {
                        fresh.push(entry.clone());
                    }
                }
                None => {
                    if core.log.append(entry.clone()).is_ok() {
                        fresh.push(entry.clone());
                    }
                }
            }
        }

        if !fresh.is_empty() {
            if let Err(e) = self.store.append_entries(&fresh).await {
                error!(error = %e, "log append failed");
                return AppendEntriesResponse {
                    term: core.current_term,
                    success: false,
                    conflict_index: None,
                    conflict_term: None,
                };
            }
        }

        // Only entries this request vouched for may commit here
        let last_new = request.prev_log_index + request.entries.len() as u64;
        let candidate = std::cmp::min(request.leader_commit, last_new);
        if candidate > core.commit_index {
            core.commit_index = candidate;
            self.apply_committed(&mut core);
        }

        let response = AppendEntriesResponse {
            term: core.current_term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        };

        if request.timeout_now {
            info!("leadership transfer signal received; starting election");
            self.start_election(&mut core).await;
        }

        response
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn spawn_election_timer(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let (deadline, is_leader) = {
                    let core = node.core.lock().await;
                    if core.shutdown {
                        return;
                    }
                    (core.election_deadline, core.role == RaftRole::Leader)
                };

                // Leaders have no election timer; park until a role change
                // resets it
                if is_leader {
                    tokio::select! {
                        _ = node.cancel.cancelled() => return,
                        _ = node.timer_reset.notified() => continue,
                    }
                }

                tokio::select! {
                    _ = node.cancel.cancelled() => return,
                    _ = node.timer_reset.notified() => continue,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                let mut core = node.core.lock().await;
                if core.shutdown {
                    return;
                }
                // The deadline may have moved while we slept
                if core.role != RaftRole::Leader && Instant::now() >= core.election_deadline {
                    node.start_election(&mut core).await;
                }
            }
        });
    }

    async fn start_election(self: &Arc<Self>, core: &mut RaftCore) {
        core.role = RaftRole::Candidate;
        core.current_term += 1;
        core.voted_for = Some(self.id.clone());
        core.votes_received = HashSet::from([self.id.clone()]);
        if core.leader_id.take().is_some() {
            let _ = self.events.send(RaftEvent::LeaderChange { leader_id: None });
        }
        self.reset_election_timer(core);

        if let Err(e) = self.persist_term_and_vote(core).await {
            error!(error = %e, "failed to persist candidacy; retreating to follower");
            core.role = RaftRole::Follower;
            return;
        }

        info!(node = %self.id, term = core.current_term, "starting election");
        let _ = self.events.send(RaftEvent::StateChange {
            role: RaftRole::Candidate,
            term: core.current_term,
        });

        if core.peers.is_empty() {
            // Single-node cluster: trivially a majority
            self.become_leader(core).await;
            return;
        }

        let request = VoteRequest {
            term: core.current_term,
            candidate_id: self.id.clone(),
            last_log_index: core.log.last_index(),
            last_log_term: core.log.last_term(),
        };
        for peer in core.peers.clone() {
            let node = self.clone();
            let request = request.clone();
            tokio::spawn(async move {
                node.solicit_vote(peer, request).await;
            });
        }
    }

    async fn solicit_vote(self: Arc<Self>, peer: NodeId, request: VoteRequest) {
        let rpc_timeout = Duration::from_millis(self.config.vote_rpc_timeout_ms);
        let term = request.term;
        match tokio::time::timeout(rpc_timeout, self.transport.request_vote(&peer, request)).await
        {
            Ok(Ok(response)) => self.on_vote_response(peer, term, response).await,
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "vote request failed"),
            Err(_) => debug!(peer = %peer, "vote request timed out"),
        }
    }

    async fn on_vote_response(&self, from: NodeId, request_term: u64, response: VoteResponse) {
        let mut core = self.core.lock().await;

        if response.term > core.current_term {
            self.observe_higher_term(&mut core, response.term).await;
            return;
        }
        if core.role != RaftRole::Candidate || core.current_term != request_term {
            return;
        }
        if response.vote_granted {
            core.votes_received.insert(from);
            if core.votes_received.len() >= core.quorum() {
                self.become_leader(&mut core).await;
            }
        }
    }

    async fn become_leader(&self, core: &mut RaftCore) {
        info!(node = %self.id, term = core.current_term, "won election");
        core.role = RaftRole::Leader;
        core.leader_id = Some(self.id.clone());
        core.votes_received.clear();
        core.inflight.clear();

        let next = core.log.last_index() + 1;
        for peer in core.peers.clone() {
            core.next_index.insert(peer.clone(), next);
            core.match_index.insert(peer, 0);
        }

        let _ = self.events.send(RaftEvent::StateChange {
            role: RaftRole::Leader,
            term: core.current_term,
        });
        let _ = self.events.send(RaftEvent::LeaderChange {
            leader_id: Some(self.id.clone()),
        });

        // Leader-epoch marker: asserts leadership immediately and lets
        // entries from prior terms commit under the current-term rule
        let marker = LogEntry::noop(core.log.last_index() + 1, core.current_term);
        if core.log.append(marker.clone()).is_ok() {
            if let Err(e) = self.store.append_entries(&[marker]).await {
                error!(error = %e, "failed to persist leader-epoch marker");
            }
        }

        self.advance_commit(core);
        self.replicate_kick.notify_one();
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    fn spawn_replicator(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            let heartbeat = Duration::from_millis(node.config.heartbeat_interval_ms);
            loop {
                tokio::select! {
                    _ = node.cancel.cancelled() => return,
                    _ = node.replicate_kick.notified() => {}
                    _ = tokio::time::sleep(heartbeat) => {}
                }

                let mut core = node.core.lock().await;
                if core.shutdown {
                    return;
                }
                if core.role == RaftRole::Leader {
                    node.replicate_round(&mut core);
                }
            }
        });
    }

    /// Dispatch one append-entries batch to every follower without one in
    /// flight. Empty batches double as heartbeats.
    fn replicate_round(self: &Arc<Self>, core: &mut RaftCore) {
        let last_index = core.log.last_index();
        for peer in core.peers.clone() {
            if core.inflight.contains(&peer) {
                continue;
            }
            let next = core.next_index.get(&peer).copied().unwrap_or(last_index + 1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = core.log.term_at(prev_log_index).unwrap_or(0);

            let request = AppendEntriesRequest {
                term: core.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries: core.log.range(next, last_index),
                leader_commit: core.commit_index,
                timeout_now: false,
            };

            core.inflight.insert(peer.clone());
            let node = self.clone();
            tokio::spawn(async move {
                node.send_append(peer, request).await;
            });
        }
    }

    async fn send_append(self: Arc<Self>, peer: NodeId, request: AppendEntriesRequest) {
        let rpc_timeout = Duration::from_millis(self.config.append_rpc_timeout_ms());
        let sent_term = request.term;
        let last_sent = request.prev_log_index + request.entries.len() as u64;

        let result =
            tokio::time::timeout(rpc_timeout, self.transport.append_entries(&peer, request)).await;

        let mut core = self.core.lock().await;
        core.inflight.remove(&peer);

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "append-entries failed; will retry");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "append-entries timed out; will retry");
                return;
            }
        };

        if response.term > core.current_term {
            self.observe_higher_term(&mut core, response.term).await;
            return;
        }
        if core.role != RaftRole::Leader || core.current_term != sent_term {
            return;
        }

        if response.success {
            let matched = core.match_index.entry(peer.clone()).or_insert(0);
            if last_sent > *matched {
                *matched = last_sent;
            }
            core.next_index.insert(peer.clone(), last_sent + 1);
            self.advance_commit(&mut core);
            if core.next_index.get(&peer).copied().unwrap_or(0) <= core.log.last_index() {
                self.replicate_kick.notify_one();
            }
        } else {
            // Log-matching walk-back, jumping with the follower's hint
            let fallback = core.log.last_index() + 1;
            let next = core.next_index.entry(peer.clone()).or_insert(fallback);
            match response.conflict_index {
                Some(hint) => *next = hint.max(1),
                None => *next = next.saturating_sub(1).max(1),
            }
            debug!(peer = %peer, next = *next, "append-entries rejected; walking back");
            self.replicate_kick.notify_one();
        }
    }

    /// Leader commit rule: a majority must hold index N and `log[N]` must
    /// be from the current term. Entries from prior terms never commit by
    /// count alone.
    fn advance_commit(&self, core: &mut RaftCore) {
        if core.role != RaftRole::Leader {
            return;
        }
        let quorum = core.quorum();
        let mut n = core.log.last_index();
        while n > core.commit_index {
            match core.log.term_at(n) {
                Some(term) if term == core.current_term => {
                    let replicas = 1 + core
                        .peers
                        .iter()
                        .filter(|p| core.match_index.get(*p).copied().unwrap_or(0) >= n)
                        .count();
                    if replicas >= quorum {
                        core.commit_index = n;
                        break;
                    }
                }
                // Terms are monotone in the log: once below the current
                // term nothing further down qualifies either
                Some(_) => break,
                None => break,
            }
            n -= 1;
        }
        self.apply_committed(core);
    }

    /// Apply every newly committed entry in index order and publish commit
    /// events. Runs inside the core critical section.
    fn apply_committed(&self, core: &mut RaftCore) {
        while core.last_applied < core.commit_index {
            core.last_applied += 1;
            let entry = match core.log.entry(core.last_applied) {
                Some(e) => e.clone(),
                None => {
                    error!(index = core.last_applied, "commit index ran past the log");
                    core.last_applied -= 1;
                    return;
                }
            };
            for applier in self.appliers.read().iter() {
                applier(&entry);
            }
            let _ = self.events.send(RaftEvent::Commit { entry });
        }
    }

    // ------------------------------------------------------------------
    // Role plumbing
    // ------------------------------------------------------------------

    fn reset_election_timer(&self, core: &mut RaftCore) {
        let span = self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms;
        let timeout = rand::thread_rng().gen_range(span);
        core.election_deadline = Instant::now() + Duration::from_millis(timeout);
        self.timer_reset.notify_one();
    }

    /// Saw a higher term somewhere: step to follower in that term.
    async fn observe_higher_term(&self, core: &mut RaftCore, term: u64) {
        debug!(node = %self.id, term, "observed higher term");
        core.current_term = term;
        core.voted_for = None;
        if core.leader_id.take().is_some() {
            let _ = self.events.send(RaftEvent::LeaderChange { leader_id: None });
        }
        if core.role != RaftRole::Follower {
            core.role = RaftRole::Follower;
            let _ = self.events.send(RaftEvent::StateChange {
                role: RaftRole::Follower,
                term,
            });
        }
        self.reset_election_timer(core);
        if let Err(e) = self.persist_term_and_vote(core).await {
            error!(error = %e, "failed to persist term step");
        }
    }

    /// Leader/candidate yields within the current term (saw the real
    /// leader's append-entries, or stepped down for a transfer).
    fn become_follower_same_term(&self, core: &mut RaftCore) {
        if core.role == RaftRole::Follower {
            return;
        }
        core.role = RaftRole::Follower;
        core.votes_received.clear();
        self.reset_election_timer(core);
        let _ = self.events.send(RaftEvent::StateChange {
            role: RaftRole::Follower,
            term: core.current_term,
        });
    }

    async fn persist_term_and_vote(&self, core: &RaftCore) -> Result<()> {
        self.store.save_term(core.current_term).await?;
        self.store.save_vote(core.voted_for.clone()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Proposer for RaftNode {
    async fn propose(&self, kind: EntryKind, payload: Vec<u8>) -> Result<LogPosition> {
        RaftNode::propose(self, kind, payload).await
    }

    async fn is_leader(&self) -> bool {
        RaftNode::is_leader(self).await
    }

    async fn leader_id(&self) -> Option<NodeId> {
        self.leader().await
    }
}
