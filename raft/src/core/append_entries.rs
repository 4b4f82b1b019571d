use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftResult;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle an AppendEntries RPC, per §5.3 of the Raft paper.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_append_entries_request(&mut self, rpc: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        if rpc.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.save_hard_state().await?;
        }

        // A valid AppendEntries, regardless of content, is proof of a live leader: reset the
        // election clock and step down from candidate/leader if we were one.
        self.reset_election_timeout();
        self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id));
        if !matches!(self.target_state, State::Follower) {
            self.set_target_state(State::Follower);
        }

        // Consistency check: the entry immediately preceding the new ones must match.
        if rpc.prev_log_id.index > 0 {
            let matches = if rpc.prev_log_id == self.last_log_id {
                true
            } else {
                match self.storage.try_get_log_entry(rpc.prev_log_id.index).await.map_err(|err| self.map_fatal_storage_error(err))? {
                    Some(entry) => entry.log_id == rpc.prev_log_id,
                    None => false,
                }
            };
            if !matches {
                let conflict_opt = self.first_index_of_conflicting_term(rpc.prev_log_id).await?;
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt,
                });
            }
        }

        if !rpc.entries.is_empty() {
            // Truncate any conflicting suffix, then append the new entries.
            let first_new_index = rpc.entries[0].log_id.index;
            if first_new_index <= self.last_log_id.index {
                self.storage.delete_logs_from(first_new_index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            }
            let refs: Vec<_> = rpc.entries.iter().collect();
            self.storage.append_to_log(&refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = rpc.entries.last().map(|e| e.log_id).unwrap_or(self.last_log_id);
        }

        if rpc.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(rpc.leader_commit, self.last_log_id.index);
            self.apply_committed_entries().await?;
        }

        self.report_metrics();
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Find the first log index belonging to the term that conflicts with `prev_log_id`, so
    /// the leader can skip its `next_index` back by a whole term at a time instead of one
    /// entry per round trip.
    async fn first_index_of_conflicting_term(&mut self, prev_log_id: LogId) -> RaftResult<Option<LogId>> {
        if prev_log_id.index > self.last_log_id.index {
            // Follower's log is simply shorter than the leader thinks.
            return Ok(Some(self.last_log_id));
        }
        let conflict_term = match self.storage.try_get_log_entry(prev_log_id.index).await.map_err(|err| self.map_fatal_storage_error(err))? {
            Some(entry) => entry.log_id.term,
            None => return Ok(Some(self.last_log_id)),
        };
        let mut idx = prev_log_id.index;
        loop {
            if idx <= 1 {
                return Ok(Some(LogId::new(conflict_term, idx)));
            }
            let prev = self.storage.try_get_log_entry(idx - 1).await.map_err(|err| self.map_fatal_storage_error(err))?;
            match prev {
                Some(entry) if entry.log_id.term == conflict_term => idx -= 1,
                _ => return Ok(Some(LogId::new(conflict_term, idx))),
            }
        }
    }
}
