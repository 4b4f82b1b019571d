use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftResult;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle a RequestVote RPC, per §5.2 and §5.4 of the Raft paper.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_vote_request(&mut self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        if rpc.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            if !matches!(self.target_state, State::Follower) {
                self.set_target_state(State::Follower);
            }
            self.save_hard_state().await?;
        }

        let already_voted_for_other = matches!(self.voted_for, Some(candidate) if candidate != rpc.candidate_id);
        // §5.4.1: a candidate's log must be at least as up-to-date as ours to earn our vote.
        let candidate_is_up_to_date = rpc.last_log_id >= self.last_log_id;

        if already_voted_for_other || !candidate_is_up_to_date {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.voted_for = Some(rpc.candidate_id);
        self.save_hard_state().await?;
        self.reset_election_timeout();
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Fan a RequestVote RPC out to every peer in parallel, reporting each reply back over the
    /// returned channel as it arrives.
    pub(super) fn spawn_parallel_vote_requests(&self) -> tokio::sync::mpsc::UnboundedReceiver<(NodeId, anyhow::Result<VoteResponse>)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let rpc = VoteRequest::new(self.core.current_term, self.core.id, self.core.last_log_id);

        for &peer in self.core.membership.members.iter() {
            if peer == self.core.id {
                continue;
            }
            let net = self.core.network.clone();
            let tx = tx.clone();
            let rpc = rpc.clone();
            tokio::spawn(async move {
                let res = net.send_vote(peer, rpc).await;
                let _ = tx.send((peer, res));
            });
        }
        rx
    }

    /// Fold a single peer's vote response into this election's tally, returning `true` once
    /// the outer loop should stop (either because we won, or because we must step down).
    pub(super) async fn handle_vote_response(&mut self, _peer: NodeId, res: anyhow::Result<VoteResponse>) -> RaftResult<bool> {
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!(error=?err, "error sending RequestVote RPC to peer");
                return Ok(false);
            }
        };

        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.set_target_state(State::Follower);
            return Ok(true);
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                return Ok(true);
            }
        }
        Ok(false)
    }
}
