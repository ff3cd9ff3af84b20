use crate::log::EntryKind;
use cortex_common::{NodeId, Result};

/// Position of an accepted proposal in the replicated log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub index: u64,
    pub term: u64,
}

/// Narrow write handle into consensus.
///
/// Components that need to replicate state (membership, node reports) hold
/// this instead of the full consensus node, which keeps the dependency
/// graph acyclic: consensus talks to peers described by membership, and
/// membership proposes through this handle.
#[async_trait::async_trait]
pub trait Proposer: Send + Sync {
    /// Leader-only; non-leaders get `NotLeader` with a redirect hint.
    async fn propose(&self, kind: EntryKind, payload: Vec<u8>) -> Result<LogPosition>;

    async fn is_leader(&self) -> bool;

    async fn leader_id(&self) -> Option<NodeId>;
}
