use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::core::RaftCore;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The fixed set of nodes participating in a cluster's consensus.
///
/// Unlike a dynamic-membership Raft, there is no "joint consensus" intermediate state here:
/// this crate does not support adding or removing voters once a cluster has been initialized.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub members: BTreeSet<NodeId>,
}

impl MembershipConfig {
    pub fn new(members: BTreeSet<NodeId>) -> Self {
        Self { members }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }
}

/// A single entry in the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// A placeholder entry with no payload, committed by a new leader per §8 of the Raft
    /// paper so that entries from prior terms become indirectly committed.
    pub fn new_blank(log_id: LogId) -> Self {
        Self {
            log_id,
            payload: EntryPayload::Blank,
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        match &self.payload {
            EntryPayload::Blank => format!("{} blank", self.log_id),
            EntryPayload::Normal(_) => format!("{} normal", self.log_id),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed at the start of a new leader's term.
    Blank,
    /// A client-proposed state machine command.
    Normal(EntryNormal<D>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    pub data: D,
}

/// RequestVote RPC, per §5.2.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            last_log_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC, per §5.3. Also used, with an empty `entries`, as a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    pub entries: Vec<Entry<D>>,
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev_log_id={} entries={} leader_commit={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.entries.len(),
            self.leader_commit
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// When `success` is false, the follower's best guess at where the logs diverge, so the
    /// leader can jump `next_index` back directly instead of decrementing one entry at a time.
    pub conflict_opt: Option<LogId>,
}

/// A client-proposed command to append to the log.
#[derive(Debug)]
pub struct ClientWriteRequest<D: AppData> {
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> ClientWriteRequest<D> {
    pub fn new(entry: D) -> Self {
        Self {
            entry: EntryPayload::Normal(EntryNormal { data: entry }),
        }
    }

    pub(crate) fn new_blank_payload() -> Self {
        Self { entry: EntryPayload::Blank }
    }
}

#[derive(Clone, Debug)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub log_id: LogId,
    pub data: R,
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<(), ClientReadError>>;

pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    ClientReadRequest {
        tx: ClientReadResponseTx,
    },
}

impl<D: AppData, R: AppDataResponse> MessageSummary for RaftMsg<D, R> {
    fn summary(&self) -> String {
        match self {
            RaftMsg::AppendEntries { rpc, .. } => format!("append_entries: {}", rpc.summary()),
            RaftMsg::RequestVote { rpc, .. } => format!("request_vote: term={} candidate={}", rpc.term, rpc.candidate_id),
            RaftMsg::ClientWriteRequest { .. } => "client_write_request".into(),
            RaftMsg::ClientReadRequest { .. } => "client_read_request".into(),
        }
    }
}

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// A handle to a running Raft node.
///
/// Cloning a `Raft` is cheap: it is a thin `Arc` wrapper around a channel into the node's
/// single-threaded core task, which owns all mutable Raft state. Every public method here
/// round-trips a message through that channel and awaits the core's reply; none of them hold
/// any lock across an `.await`.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Construct and spawn a new Raft node, bootstrapping it with the given, fixed cluster
    /// membership.
    pub fn new(id: NodeId, config: Arc<crate::Config>, members: BTreeSet<NodeId>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        let membership = MembershipConfig::new(members);
        let raft_handle = RaftCore::spawn(id, config, membership, network, storage, rx_api, tx_metrics, rx_shutdown);

        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, tracing::Span::current()))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, tracing::Span::current()))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// The node id this handle currently believes to be leader, if any.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Block until this node is confident it is still leader, or return an error identifying
    /// who to retry against.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientReadRequest { tx }, tracing::Span::current()))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Propose a command, returning once it has been committed to a majority of the cluster
    /// and applied to this node's state machine.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientWriteRequest { rpc, tx }, tracing::Span::current()))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// The current metrics stream for this node; subscribe to be notified of every update.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Wait until the given predicate over this node's metrics holds, or the timeout elapses.
    pub async fn wait_for_metrics(&self, timeout: std::time::Duration, f: impl Fn(&RaftMetrics) -> bool) -> RaftResult<RaftMetrics> {
        let mut rx = self.metrics();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let m = rx.borrow();
                if f(&m) {
                    return Ok(m.clone());
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RaftError::ShuttingDown);
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Err(RaftError::ShuttingDown),
            }
        }
    }

    /// Gracefully shut down the underlying core task, waiting for it to finish.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await.map_err(|_| RaftError::ShuttingDown)??;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}
