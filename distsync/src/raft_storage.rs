//! A [`raft::RaftStorage`] implementation backed by the platform's own durable store: log
//! entries and hard state live under the `raft:log:<index>` / `raft:meta` keys described in
//! §6, with an in-memory index for the range queries the Raft core issues on every round.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use raft::Entry;
use raft::HardState;
use raft::InitialState;
use raft::LogId;
use raft::RaftStorage;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::state_machine::DistSyncStateMachine;
use crate::store::keys;
use crate::store::DurableStore;

pub struct Storage<D: DurableStore> {
    store: Arc<D>,
    log: Mutex<BTreeMap<u64, Entry<Command>>>,
    state_machine: tokio::sync::Mutex<DistSyncStateMachine>,
}

impl<D: DurableStore> Storage<D> {
    pub fn new(store: Arc<D>, state_machine: DistSyncStateMachine) -> Self {
        Self {
            store,
            log: Mutex::new(BTreeMap::new()),
            state_machine: tokio::sync::Mutex::new(state_machine),
        }
    }

    pub async fn with_state_machine<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut DistSyncStateMachine) -> T,
    {
        let mut sm = self.state_machine.lock().await;
        f(&mut sm)
    }

    /// The durable store's current value for `key`, bypassing the local cache entirely. Used
    /// by the leader to answer a peer's read-miss query (§4.6).
    pub async fn cache_read_through(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.state_machine.lock().await.cache_read_through(key).await
    }

    /// Reinsert any durably-stored, undelivered messages into their partition queues. Run once
    /// by a freshly elected leader (§4.5 Recovery).
    pub async fn recover_messages(&self) -> anyhow::Result<usize> {
        self.state_machine.lock().await.recover_messages().await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("fatal storage error")]
pub struct StorageShutdownError;

#[async_trait]
impl<D: DurableStore> RaftStorage<Command, CommandResponse> for Storage<D> {
    type ShutdownError = StorageShutdownError;

    async fn get_initial_state(&self) -> anyhow::Result<InitialState> {
        let hard_state = match self.store.get(keys::RAFT_META).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => HardState::default(),
        };

        let mut log = self.log.lock().unwrap();
        for key in self.store.scan("raft:log:").await? {
            if let Some(bytes) = self.store.get(&key).await? {
                let entry: Entry<Command> = serde_json::from_slice(&bytes)?;
                log.insert(entry.log_id.index, entry);
            }
        }
        let last_log_id = log.values().last().map(|e| e.log_id).unwrap_or_default();

        Ok(InitialState {
            last_log_id,
            last_applied: LogId::default(),
            hard_state,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        self.store.put(keys::RAFT_META, serde_json::to_vec(hs)?, None).await
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Send + Sync + 'static>(&self, range: RNG) -> anyhow::Result<Vec<Entry<Command>>> {
        let log = self.log.lock().unwrap();
        Ok(log.range(bound_pair(&range)).map(|(_, e)| e.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: u64) -> anyhow::Result<Option<Entry<Command>>> {
        Ok(self.log.lock().unwrap().get(&index).cloned())
    }

    async fn get_last_log_id(&self) -> anyhow::Result<LogId> {
        Ok(self.log.lock().unwrap().values().last().map(|e| e.log_id).unwrap_or_default())
    }

    async fn delete_logs_from(&self, index: u64) -> anyhow::Result<()> {
        let removed: Vec<u64> = {
            let mut log = self.log.lock().unwrap();
            let keep = log.split_off(&index);
            let removed = log.keys().copied().collect::<Vec<_>>();
            *log = keep;
            removed
        };
        for idx in removed {
            self.store.delete(&keys::raft_log(idx)).await?;
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<Command>]) -> anyhow::Result<()> {
        for entry in entries {
            self.store.put(&keys::raft_log(entry.log_id.index), serde_json::to_vec(entry)?, None).await?;
            self.log.lock().unwrap().insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<Command>]) -> anyhow::Result<Vec<CommandResponse>> {
        let mut sm = self.state_machine.lock().await;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let response = match &entry.payload {
                raft::EntryPayload::Blank => CommandResponse::Blank,
                raft::EntryPayload::Normal(normal) => sm.apply(&normal.data).await?,
            };
            out.push(response);
        }
        Ok(out)
    }
}

fn bound_pair<RNG: RangeBounds<u64>>(range: &RNG) -> (Bound<u64>, Bound<u64>) {
    (cloned_bound(range.start_bound()), cloned_bound(range.end_bound()))
}

fn cloned_bound(b: Bound<&u64>) -> Bound<u64> {
    match b {
        Bound::Included(v) => Bound::Included(*v),
        Bound::Excluded(v) => Bound::Excluded(*v),
        Bound::Unbounded => Bound::Unbounded,
    }
}
