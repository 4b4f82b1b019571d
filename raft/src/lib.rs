//! A small, single-Raft consensus engine for clusters with a fixed, static membership.
//!
//! This crate implements the replicated log, leader election, and commit/apply pipeline
//! described in the Raft paper. Unlike a general-purpose Raft implementation it does not
//! support dynamic membership changes or snapshot-based log compaction: a cluster's voter
//! set is fixed for the lifetime of the `Raft` handle, and the log is expected to be kept
//! at a size the application is comfortable replaying in full on restart.

mod config;
pub mod core;
mod error;
mod metrics;
mod network;
pub mod quorum;
mod raft;
mod storage;

pub use config::Config;
pub use config::ConfigBuilder;
pub use error::ClientReadError;
pub use error::ClientWriteError;
pub use error::RaftError;
pub use error::RaftResult;
pub use metrics::LeaderMetrics;
pub use metrics::RaftMetrics;
pub use metrics::State;
pub use network::RaftNetwork;
pub use raft::AppendEntriesRequest;
pub use raft::AppendEntriesResponse;
pub use raft::ClientWriteRequest;
pub use raft::ClientWriteResponse;
pub use raft::Entry;
pub use raft::EntryPayload;
pub use raft::MembershipConfig;
pub use raft::Raft;
pub use raft::VoteRequest;
pub use raft::VoteResponse;
pub use storage::HardState;
pub use storage::InitialState;
pub use storage::RaftStorage;

use std::fmt;

/// A Raft node identifier. Node ids are assigned out-of-band and are expected to be stable
/// for the lifetime of the cluster.
pub type NodeId = u64;

/// A value that may be appended to the replicated log as a client command.
///
/// State machines built on top of this crate encode their mutating operations as `AppData`
/// values; the log replicates them byte-for-byte and applies them to every node's state
/// machine in the same order.
pub trait AppData: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {}

/// The result of applying an `AppData` command to a state machine.
pub trait AppDataResponse: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {}

/// A single point in the replicated log, identified by the term in which it was created and
/// its position in the log.
///
/// Log ids order first by `term` and then by `index`, matching the "more up-to-date" check
/// used during elections (§5.4.1 of the Raft paper).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// Produces a terse, tracing-friendly summary of a value, used so RPC payloads don't need to
/// derive `Debug` output that can run to megabytes for large entry batches.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
