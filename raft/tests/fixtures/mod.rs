//! Fixtures for testing `Raft` end-to-end: an in-memory storage backend and an in-process
//! network double, wired together the same way a real deployment wires `TcpNetwork` and a
//! durable-store-backed `RaftStorage` impl, minus the I/O.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use raft::AppData;
use raft::AppDataResponse;
use raft::AppendEntriesRequest;
use raft::AppendEntriesResponse;
use raft::Config;
use raft::Entry;
use raft::EntryPayload;
use raft::HardState;
use raft::InitialState;
use raft::LogId;
use raft::NodeId;
use raft::Raft;
use raft::RaftMetrics;
use raft::RaftNetwork;
use raft::RaftStorage;
use raft::State;
use raft::VoteRequest;
use raft::VoteResponse;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The only command the test fixtures ever replicate: set `key` to `value` in every replica's
/// map. Enough to exercise election, replication, and apply-order without pulling in the
/// platform's own `Command` vocabulary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCommand {
    pub key: String,
    pub value: u64,
}

impl AppData for TestCommand {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResponse {
    pub key: String,
    pub value: u64,
}

impl AppDataResponse for TestResponse {}

/// An in-memory `RaftStorage` good enough to drive a test cluster: the log lives in a
/// `BTreeMap`, the "state machine" is just the last value written per key.
pub struct TestStorage {
    log: Mutex<BTreeMap<u64, Entry<TestCommand>>>,
    hard_state: Mutex<HardState>,
    state_machine: Mutex<BTreeMap<String, u64>>,
    pub last_applied: Mutex<LogId>,
}

impl TestStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(BTreeMap::new()),
            hard_state: Mutex::new(HardState::default()),
            state_machine: Mutex::new(BTreeMap::new()),
            last_applied: Mutex::new(LogId::default()),
        })
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.state_machine.lock().unwrap().get(key).copied()
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("test storage shutdown")]
pub struct TestStorageShutdownError;

#[async_trait]
impl RaftStorage<TestCommand, TestResponse> for TestStorage {
    type ShutdownError = TestStorageShutdownError;

    async fn get_initial_state(&self) -> Result<InitialState> {
        let last_log_id = self.log.lock().unwrap().values().last().map(|e| e.log_id).unwrap_or_default();
        Ok(InitialState {
            last_log_id,
            last_applied: *self.last_applied.lock().unwrap(),
            hard_state: self.hard_state.lock().unwrap().clone(),
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hard_state.lock().unwrap() = hs.clone();
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Send + Sync + 'static>(&self, range: RNG) -> Result<Vec<Entry<TestCommand>>> {
        Ok(self.log.lock().unwrap().range(range).map(|(_, e)| e.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<TestCommand>>> {
        Ok(self.log.lock().unwrap().get(&index).cloned())
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        Ok(self.log.lock().unwrap().values().last().map(|e| e.log_id).unwrap_or_default())
    }

    async fn delete_logs_from(&self, index: u64) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        let keep = log.split_off(&index);
        *log = keep;
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<TestCommand>]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<TestCommand>]) -> Result<Vec<TestResponse>> {
        let mut sm = self.state_machine.lock().unwrap();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let resp = match &entry.payload {
                EntryPayload::Blank => TestResponse { key: String::new(), value: 0 },
                EntryPayload::Normal(normal) => {
                    sm.insert(normal.data.key.clone(), normal.data.value);
                    TestResponse { key: normal.data.key.clone(), value: normal.data.value }
                }
            };
            *self.last_applied.lock().unwrap() = entry.log_id;
            out.push(resp);
        }
        Ok(out)
    }
}

pub type TestRaft = Raft<TestCommand, TestResponse, TestRouter, TestStorage>;

/// An in-process stand-in for [`raft::RaftNetwork`] that routes RPCs directly to other nodes'
/// `Raft` handles in the same process, the way the platform's `TcpNetwork` routes them over a
/// socket. Nodes in `isolated_nodes` silently drop every RPC sent to or received from them,
/// modeling a network partition.
pub struct TestRouter {
    routing_table: RwLock<BTreeMap<NodeId, (TestRaft, Arc<TestStorage>)>>,
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl TestRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
        })
    }

    /// Build and register a node for every id in `members`, all sharing the same static
    /// membership set from the moment they start.
    pub async fn new_cluster(self: &Arc<Self>, config: Arc<Config>, members: BTreeSet<NodeId>) {
        for id in members.iter().copied() {
            let storage = TestStorage::new();
            let raft = Raft::new(id, config.clone(), members.clone(), self.clone(), storage.clone());
            self.routing_table.write().await.insert(id, (raft, storage));
        }
    }

    pub async fn isolate(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    pub async fn restore(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|(raft, _)| raft.metrics().borrow().clone()).collect()
    }

    pub async fn storage(&self, id: NodeId) -> Arc<TestStorage> {
        let rt = self.routing_table.read().await;
        rt.get(&id).expect("node registered").1.clone()
    }

    pub async fn wait_for_metrics(&self, id: NodeId, timeout: Duration, f: impl Fn(&RaftMetrics) -> bool + Send) -> Result<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let (raft, _) = rt.get(&id).with_context(|| format!("node {} not registered", id))?;
        Ok(raft.wait_for_metrics(timeout, f).await?)
    }

    pub async fn client_write(&self, id: NodeId, key: &str, value: u64) -> Result<(), raft::ClientWriteError> {
        let rt = self.routing_table.read().await;
        let (raft, _) = rt.get(&id).expect("node registered");
        raft.client_write(raft::ClientWriteRequest::new(TestCommand { key: key.into(), value })).await?;
        Ok(())
    }

    /// The single id, if any, that believes itself to be a non-isolated leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics()
            .await
            .into_iter()
            .find(|m| m.state.is_leader() && !isolated.contains(&m.id))
            .map(|m| m.id)
    }
}

#[async_trait]
impl RaftNetwork<TestCommand> for TestRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<TestCommand>) -> Result<AppendEntriesResponse> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("node {} is isolated", target));
        }
        let rt = self.routing_table.read().await;
        let (raft, _) = rt.get(&target).with_context(|| format!("node {} not registered", target))?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("node {} is isolated", target));
        }
        let rt = self.routing_table.read().await;
        let (raft, _) = rt.get(&target).with_context(|| format!("node {} not registered", target))?;
        Ok(raft.vote(rpc).await?)
    }
}

pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test-cluster")
            .heartbeat_interval(50)
            .election_timeout_min(300)
            .election_timeout_max(500)
            .validate()
            .expect("valid test config"),
    )
}

pub fn members(ids: &[NodeId]) -> BTreeSet<NodeId> {
    ids.iter().copied().collect()
}

pub use State as TestState;
