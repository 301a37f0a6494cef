use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("append at index {index} would rewrite committed history (commit index {commit_index})")]
    Conflict { index: u64, commit_index: u64 },

    #[error("log entries up to index {start_index} were compacted (requested index {index})")]
    Compacted { index: u64, start_index: u64 },

    #[error("invalid compaction boundary {index}/{term}: {reason}")]
    InvalidCompaction {
        index: u64,
        term: u64,
        reason: &'static str,
    },

    #[error("append out of order: expected index <= {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("no snapshot has been persisted")]
    NoSnapshot,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("node halted after a state machine failure: {0}")]
    Halted(String),

    #[error("command at index {index} was not committed within the timeout")]
    CommandTimeout { index: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("persisted log has a gap after index {after}")]
    LogGap { after: u64 },

    #[error("server is shutting down")]
    Shutdown,
}

impl RaftError {
    /// Whether the error means "nothing to install" rather than a real failure.
    pub fn is_no_snapshot(&self) -> bool {
        matches!(self, RaftError::NoSnapshot)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to {0} timed out")]
    Timeout(NodeId),

    #[error("http error: {0}")]
    Http(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;
