use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::LogId;
use crate::NodeId;

/// The state a Raft node believes itself to be in.
///
/// Dynamic membership means async-raft's upstream also models a transient `NonVoter` state;
/// this crate's clusters are fully voting from the moment they're initialized, so only the
/// three states from the original paper are needed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

impl State {
    pub fn is_follower(&self) -> bool {
        matches!(self, State::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, State::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, State::Leader)
    }
}

/// A snapshot of a Raft node's observable state, published on every state transition and on
/// every successful commit while leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership_config: Vec<NodeId>,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: vec![],
            leader_metrics: None,
        }
    }
}

/// Replication progress per follower, only populated while this node is leader.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, LogId>,
}
