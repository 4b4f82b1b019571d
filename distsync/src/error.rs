use thiserror::Error;

use raft::NodeId;

/// An error surfaced to a client of the lock, queue, or cache APIs.
///
/// Mirrors the error kinds a caller actually needs to branch on; transport- and storage-level
/// failures are folded into [`DistSyncError::Io`] once they've been decided as unrecoverable for
/// the current request.
#[derive(Clone, Debug, Error)]
pub enum DistSyncError {
    /// This node is not the Raft leader. Retry against `hint_leader_id`, if known.
    #[error("not leader (hint: {hint_leader_id:?})")]
    NotLeader { hint_leader_id: Option<NodeId> },

    /// The deadline passed before the operation could be confirmed. The underlying proposal,
    /// if one was made, is not retracted and may still commit.
    #[error("operation timed out")]
    Timeout,

    /// A non-blocking (`timeout = 0`) lock request found the resource held incompatibly.
    #[error("resource held incompatibly")]
    Conflict,

    /// The caller was chosen as the victim of deadlock resolution.
    #[error("aborted: deadlock victim")]
    AbortedDeadlock,

    /// Read-through was disabled and the key was not cached, or the message/resource referenced
    /// does not exist.
    #[error("not found")]
    NotFound,

    /// The durable store or the peer transport failed in a way the caller must see.
    #[error("io error: {0}")]
    Io(String),
}

pub type DistSyncResult<T> = std::result::Result<T, DistSyncError>;

impl From<raft::RaftError> for DistSyncError {
    fn from(err: raft::RaftError) -> Self {
        match err {
            raft::RaftError::ShuttingDown => DistSyncError::Io("raft core is shutting down".into()),
            raft::RaftError::RaftStorage(err) => DistSyncError::Io(err.to_string()),
        }
    }
}

impl From<raft::ClientWriteError> for DistSyncError {
    fn from(err: raft::ClientWriteError) -> Self {
        match err {
            raft::ClientWriteError::ForwardToLeader { leader } => DistSyncError::NotLeader { hint_leader_id: leader },
            raft::ClientWriteError::RaftError(err) => err.into(),
        }
    }
}

impl From<raft::ClientReadError> for DistSyncError {
    fn from(err: raft::ClientReadError) -> Self {
        match err {
            raft::ClientReadError::ForwardToLeader { leader } => DistSyncError::NotLeader { hint_leader_id: leader },
            raft::ClientReadError::QuorumNotReached => DistSyncError::Timeout,
            raft::ClientReadError::RaftError(err) => err.into(),
        }
    }
}

impl From<anyhow::Error> for DistSyncError {
    fn from(err: anyhow::Error) -> Self {
        DistSyncError::Io(err.to_string())
    }
}
