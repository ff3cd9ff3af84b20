use cortex_common::Result;
use cortex_consensus::{RaftEvent, RaftNode, RaftRole};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A subsystem that must run on exactly one node at a time (the messaging
/// gateway, the scheduler's authoritative half). The activation controller
/// binds its lifetime to leadership.
#[async_trait::async_trait]
pub trait LeaderGated: Send + Sync {
    fn name(&self) -> &str;

    async fn activate(&self) -> Result<()>;

    async fn deactivate(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct ActivationState {
    active: bool,
    epoch_term: u64,
}

/// Watches consensus state transitions and starts/stops the leader-gated
/// singletons exactly once per leadership epoch.
///
/// Callbacks are serialized behind one mutex: a deactivation always
/// finishes before the next activation begins, and a duplicate leader
/// event within the same term is a no-op.
pub struct ActivationController {
    singletons: Vec<Arc<dyn LeaderGated>>,
    state: Mutex<ActivationState>,
    cancel: CancellationToken,
}

impl ActivationController {
    pub fn new(singletons: Vec<Arc<dyn LeaderGated>>) -> Arc<Self> {
        Arc::new(Self {
            singletons,
            state: Mutex::new(ActivationState::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to the consensus node and gate on its transitions. Issues
    /// one activation up front when this node already holds leadership
    /// (restart while leader).
    pub async fn start(self: &Arc<Self>, raft: &Arc<RaftNode>) {
        let initial = raft.state().await;
        if initial.role == RaftRole::Leader {
            self.observe(RaftRole::Leader, initial.term).await;
        }

        let controller = self.clone();
        let mut events = raft.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => {
                        debug!("activation controller stopped");
                        return;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(RaftEvent::StateChange { role, term }) => {
                                controller.observe(role, term).await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!(missed = n, "activation events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// Deactivate on shutdown so singletons release their external
    /// connections.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        if state.active {
            self.deactivate_all().await;
            state.active = false;
        }
    }

    /// Fold one state transition. Idempotent within a leadership epoch.
    pub async fn observe(&self, role: RaftRole, term: u64) {
        let mut state = self.state.lock().await;

        match role {
            RaftRole::Leader => {
                if state.active && state.epoch_term == term {
                    debug!(term, "duplicate leader event; already active");
                    return;
                }
                if !state.active {
                    info!(term, "gained leadership; activating singletons");
                    self.activate_all().await;
                    state.active = true;
                }
                state.epoch_term = term;
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if state.active {
                    info!(term, "lost leadership; deactivating singletons");
                    self.deactivate_all().await;
                    state.active = false;
                }
            }
        }
    }

    async fn activate_all(&self) {
        for singleton in &self.singletons {
            if let Err(e) = singleton.activate().await {
                error!(name = singleton.name(), error = %e, "activation failed");
            }
        }
    }

    async fn deactivate_all(&self) {
        for singleton in &self.singletons {
            if let Err(e) = singleton.deactivate().await {
                error!(name = singleton.name(), error = %e, "deactivation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records connect/disconnect counts like a messaging adapter would.
    struct MockSingleton {
        name: String,
        connects: AtomicU32,
        disconnects: AtomicU32,
    }

    impl MockSingleton {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl LeaderGated for MockSingleton {
        fn name(&self) -> &str {
            &self.name
        }

        async fn activate(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deactivate(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_activation_exactly_once_per_epoch() {
        let gateway = MockSingleton::new("gateway");
        let scheduler = MockSingleton::new("scheduler");
        let controller = ActivationController::new(vec![gateway.clone(), scheduler.clone()]);

        // gain leadership in term 1: both connect exactly once
        controller.observe(RaftRole::Leader, 1).await;
        assert_eq!(gateway.connects.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.connects.load(Ordering::SeqCst), 1);

        // duplicate leader events in the same term are no-ops
        controller.observe(RaftRole::Leader, 1).await;
        controller.observe(RaftRole::Leader, 1).await;
        assert_eq!(gateway.connects.load(Ordering::SeqCst), 1);

        // lose leadership: both disconnect exactly once
        controller.observe(RaftRole::Follower, 2).await;
        assert_eq!(gateway.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.disconnects.load(Ordering::SeqCst), 1);

        // regain in a later term: activation happens again
        controller.observe(RaftRole::Leader, 3).await;
        assert_eq!(gateway.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_follower_events_without_activation_are_ignored() {
        let gateway = MockSingleton::new("gateway");
        let controller = ActivationController::new(vec![gateway.clone()]);

        controller.observe(RaftRole::Follower, 1).await;
        controller.observe(RaftRole::Candidate, 2).await;
        assert_eq!(gateway.connects.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_deactivates_active_singletons() {
        let gateway = MockSingleton::new("gateway");
        let controller = ActivationController::new(vec![gateway.clone()]);

        controller.observe(RaftRole::Leader, 1).await;
        controller.stop().await;
        assert_eq!(gateway.disconnects.load(Ordering::SeqCst), 1);
    }
}
