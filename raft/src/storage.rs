use std::ops::RangeBounds;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// The durable portion of a node's term/vote bookkeeping, per §5.1 of the Raft paper. Must be
/// flushed to stable storage before the RPC that produced it is answered.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// The state a node's Raft core bootstraps from on startup.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied: LogId,
    pub hard_state: HardState,
}

impl InitialState {
    /// The state of a node that has never recorded anything: term 0, no log, nothing applied.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied: LogId::default(),
            hard_state: HardState::default(),
        }
    }
}

/// The storage contract a Raft core needs satisfied: durable log persistence, durable
/// term/vote state, and a state machine to apply committed entries to.
///
/// This is a deliberately smaller surface than a general-purpose Raft storage trait: there
/// are no snapshot or log-compaction hooks, because this crate does not implement either.
/// Implementations are expected to keep the full log on disk (or recompute it from an
/// external durable store) for the lifetime of the cluster.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// An application-specific, `downcast`-able error type signaling that this storage layer
    /// can no longer make progress and the Raft core handling it should shut down.
    type ShutdownError: std::error::Error + Send + Sync + 'static;

    /// Read back whatever hard state and log position this node last persisted.
    async fn get_initial_state(&self) -> anyhow::Result<InitialState>;

    /// Persist an updated hard state before replying to the RPC that produced it.
    async fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()>;

    /// Fetch a contiguous range of log entries.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Send + Sync + 'static>(&self, range: RNG) -> anyhow::Result<Vec<Entry<D>>>;

    /// Fetch a single log entry by index, if it exists.
    async fn try_get_log_entry(&self, index: u64) -> anyhow::Result<Option<Entry<D>>>;

    /// The id of the most recently appended log entry.
    async fn get_last_log_id(&self) -> anyhow::Result<LogId>;

    /// Delete all log entries from `index` (inclusive) onward, used to resolve a conflicting
    /// suffix when a follower's log diverges from the leader's.
    async fn delete_logs_from(&self, index: u64) -> anyhow::Result<()>;

    /// Durably append the given entries to the log.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> anyhow::Result<()>;

    /// Apply a contiguous batch of committed entries to the state machine, returning each
    /// entry's response in order.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> anyhow::Result<Vec<R>>;
}
