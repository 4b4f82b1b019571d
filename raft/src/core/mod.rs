//! The core logic of a Raft node: the single task that owns all of a node's mutable Raft
//! state and drives its role-specific loop (follower, candidate, or leader).
//!
//! Unlike a general-purpose Raft implementation, there is no non-voter/learner state and no
//! snapshot machinery: membership is the fixed set handed to [`crate::Raft::new`] for the
//! lifetime of the node, and the log is expected to be replayed in full on restart.

mod append_entries;
mod client;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::MembershipConfig;
use crate::raft::RaftMsg;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The core type implementing the Raft protocol.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's fixed membership.
    membership: MembershipConfig,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The role this node is currently playing.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    commit_index: u64,
    /// The log id of the highest entry applied to the local state machine.
    last_applied: LogId,
    /// The current term.
    current_term: u64,
    /// The id of the node this node currently believes to be leader.
    current_leader: Option<NodeId>,
    /// The candidate this node voted for in `current_term`, if any.
    voted_for: Option<NodeId>,
    /// The id of the last entry appended to the local log.
    last_log_id: LogId,

    /// The last time a valid AppendEntries or vote grant was processed; drives the election
    /// timeout.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        membership: MembershipConfig,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let this = Self {
            id,
            config,
            membership,
            network,
            storage,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn", id)))
    }

    /// The main loop of the Raft protocol: replay persisted state, then forever delegate to
    /// whichever role's loop matches `target_state` until that loop returns because the role
    /// changed (or the node is shutting down).
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.last_applied = state.last_applied;
        // It is unsafe to initialize commit_index to anything but 0: only a leader, after
        // replicating to a quorum, is allowed to advance it.
        self.commit_index = 0;

        self.target_state = State::Follower;
        self.next_election_timeout = Some(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
        self.report_metrics();

        loop {
            match self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "node has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Publish a metrics snapshot for subscribers, reusing the previously published leader
    /// metrics if this call isn't updating them.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&self) {
        let leader_metrics = self.tx_metrics.borrow().leader_metrics.clone();
        self.report_metrics_with_leader(leader_metrics);
    }

    fn report_metrics_with_leader(&self, leader_metrics: Option<LeaderMetrics>) {
        let state = match self.target_state {
            State::Follower | State::Shutdown => crate::metrics::State::Follower,
            State::Candidate => crate::metrics::State::Candidate,
            State::Leader => crate::metrics::State::Leader,
        };
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.members.iter().copied().collect(),
            leader_metrics,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id = self.id, "error reporting metrics, no subscribers left");
        }
    }

    /// Persist the node's current term/vote, per §5.1: must happen before replying to the RPC
    /// that produced the update.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Return the instant the election timer expires, creating a freshly randomized one if
    /// none is currently pending.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Reset the election timer, drawing a fresh randomized duration. Called whenever a valid
    /// AppendEntries or a granted vote is processed, per §5.2.
    fn reset_election_timeout(&mut self) {
        self.next_election_timeout = Some(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
    }

    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        self.current_leader = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => Some(target),
            UpdateCurrentLeader::Unknown => None,
        };
    }

    /// Step the term forward, resetting `voted_for` as required by §5.1. A no-op if `new_term`
    /// is not actually newer.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// A storage failure on the apply/append path is treated as fatal: shut the node down
    /// rather than risk diverging from the rest of the cluster. The next leader retries.
    #[tracing::instrument(level = "trace", skip(self, err))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=?err, id = self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::from(err)
    }

    /// Apply every committed-but-unapplied entry to the state machine, returning each entry's
    /// `(log_id, response)` pair in commit order.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_committed_entries(&mut self) -> RaftResult<Vec<(LogId, R)>> {
        if self.commit_index <= self.last_applied.index {
            return Ok(vec![]);
        }
        let start = self.last_applied.index + 1;
        let end = self.commit_index;
        let entries = self
            .storage
            .get_log_entries(start..=end)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if entries.is_empty() {
            return Ok(vec![]);
        }
        let refs: Vec<&Entry<D>> = entries.iter().collect();
        let responses = self
            .storage
            .apply_to_state_machine(&refs)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let mut out = Vec::with_capacity(entries.len());
        for (entry, response) in entries.into_iter().zip(responses.into_iter()) {
            self.last_applied = entry.log_id;
            out.push((entry.log_id, response));
        }
        self.report_metrics();
        Ok(out)
    }

    /// A non-leader rejects client writes, pointing the caller at whichever node it currently
    /// believes leads the cluster.
    fn forward_client_write_request(&self, tx: ClientWriteResponseTx<D, R>) {
        let _ = tx.send(Err(crate::error::ClientWriteError::ForwardToLeader {
            leader: self.current_leader,
        }));
    }

    fn forward_client_read_request(&self, tx: crate::raft::ClientReadResponseTx) {
        let _ = tx.send(Err(crate::error::ClientReadError::ForwardToLeader {
            leader: self.current_leader,
        }));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// All possible roles of a Raft node, per §5 of the Raft paper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum State {
    Follower,
    Candidate,
    Leader,
    /// Terminal: the node's core task is about to return.
    Shutdown,
}

impl State {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////

/// Per-follower replication progress tracked only while this node is leader.
struct ReplicationState {
    next_index: u64,
    match_index: u64,
}

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// Replication progress per peer.
    nodes: BTreeMap<NodeId, ReplicationState>,
    /// Client write requests whose entry has been appended locally but not yet committed.
    awaiting: BTreeMap<u64, ClientWriteResponseTx<D, R>>,
    leader_metrics: LeaderMetrics,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            nodes: BTreeMap::new(),
            awaiting: BTreeMap::new(),
            leader_metrics: LeaderMetrics::default(),
        }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    async fn run(mut self) -> RaftResult<()> {
        let next_index = self.core.last_log_id.index + 1;
        for &peer in self.core.membership.members.iter() {
            if peer == self.core.id {
                continue;
            }
            self.nodes.insert(peer, ReplicationState { next_index, match_index: 0 });
        }

        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8: a new leader commits a blank entry from its own term before serving reads,
        // so that entries from prior terms become indirectly committed.
        self.commit_initial_leader_entry().await?;

        let mut heartbeat = tokio::time::interval(Duration::from_millis(self.core.config.heartbeat_interval));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !self.core.target_state.is_leader() {
                self.fail_pending_with_forward();
                return Ok(());
            }

            tokio::select! {
                _ = heartbeat.tick() => {
                    self.replicate_to_all_peers().await?;
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _enter = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest { rpc, tx } => {
                            self.handle_client_write_request(rpc, tx).await?;
                        }
                        RaftMsg::ClientReadRequest { tx } => {
                            self.handle_client_read_request(tx).await;
                        }
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    fn leader_report_metrics(&self) {
        self.core.report_metrics_with_leader(Some(self.leader_metrics.clone()));
    }

    /// Reject every client write still awaiting commit, since this node is no longer leader.
    fn fail_pending_with_forward(&mut self) {
        let leader = self.core.current_leader;
        for (_, tx) in std::mem::take(&mut self.awaiting) {
            let _ = tx.send(Err(crate::error::ClientWriteError::ForwardToLeader { leader }));
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    votes_granted: u64,
    votes_needed: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    async fn run(mut self) -> RaftResult<()> {
        // Each outer iteration is a new election term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.votes_granted = 1; // Vote for ourselves, per §5.2.
            self.votes_needed = crate::quorum::majority_of(self.core.membership.members.len()) as u64;

            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.reset_election_timeout();
            self.core.report_metrics();

            if self.votes_granted >= self.votes_needed {
                // Single-node cluster: no one else to ask.
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let election_timeout = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    _ = election_timeout => break,
                    Some((peer, res)) = pending_votes.recv() => {
                        if self.handle_vote_response(peer, res).await? {
                            return Ok(());
                        }
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _enter = span.enter();
                        match msg {
                            RaftMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::ClientWriteRequest { tx, .. } => {
                                self.core.forward_client_write_request(tx);
                            }
                            RaftMsg::ClientReadRequest { tx } => {
                                self.core.forward_client_read_request(tx);
                            }
                        }
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                        return Ok(());
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _enter = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest { tx, .. } => {
                            self.core.forward_client_write_request(tx);
                        }
                        RaftMsg::ClientReadRequest { tx } => {
                            self.core.forward_client_read_request(tx);
                        }
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
