pub mod log;
pub mod node;
pub mod proposer;
pub mod store;

pub use log::{EntryKind, LogEntry, RaftLog};
pub use node::{
    AppendEntriesRequest, AppendEntriesResponse, RaftEvent, RaftNode, RaftRole, RaftTransport,
    TransferOutcome, VoteRequest, VoteResponse,
};
pub use proposer::{LogPosition, Proposer};
pub use store::{FileStore, MemoryStore, PersistentState, RaftStore};
