use std::sync::Arc;

use thiserror::Error;

use crate::NodeId;

/// An error arising from a call into the Raft core.
///
/// Wraps the storage layer's `anyhow::Error` in an `Arc` so this type stays `Clone`: a single
/// fatal storage error is both the cause of the core task shutting down and the reply sent to
/// every client write still awaiting that entry's commit.
#[derive(Clone, Debug, Error)]
pub enum RaftError {
    #[error("error from storage layer: {0}")]
    RaftStorage(Arc<anyhow::Error>),

    #[error("raft is shutting down")]
    ShuttingDown,
}

impl From<anyhow::Error> for RaftError {
    fn from(err: anyhow::Error) -> Self {
        Self::RaftStorage(Arc::new(err))
    }
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// An error returned from a client write request.
#[derive(Clone, Debug, Error)]
pub enum ClientWriteError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    /// The node receiving the request is not the cluster leader. The caller retains its
    /// original payload and is expected to retry it against the hinted leader.
    #[error("this node is not the Raft leader")]
    ForwardToLeader {
        /// The node this cluster currently believes to be leader, if known.
        leader: Option<NodeId>,
    },
}

/// An error returned from a client read request.
#[derive(Clone, Debug, Error)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("this node is not the Raft leader")]
    ForwardToLeader { leader: Option<NodeId> },

    #[error("could not confirm leadership with a quorum of peers before the read deadline")]
    QuorumNotReached,
}
