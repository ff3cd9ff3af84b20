use crate::types::NodeId;
use thiserror::Error;

/// Error taxonomy for the cluster agent.
///
/// RPC handlers never surface these directly; they are mapped to structured
/// responses at the transport boundary. Periodic workers log and continue.
#[derive(Error, Debug)]
pub enum CortexError {
    /// The operation requires leadership. Carries a redirect hint when the
    /// current leader is known.
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// The request carried a term older than ours.
    #[error("stale term {observed}, current term is {current}")]
    StaleTerm { observed: u64, current: u64 },

    /// The component is shutting down; in-flight proposals fail with this.
    #[error("shutting down")]
    Shutdown,

    #[error("operation timed out")]
    Timeout,

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("mesh probe failed: {0}")]
    Mesh(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration is fatal at startup.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CortexError {
    pub fn transport(message: impl Into<String>) -> Self {
        CortexError::Transport {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        CortexError::Config {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CortexError>;
