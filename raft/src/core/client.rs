use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftResult;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit a single blank entry in the new leader's own term, per §8 of the Raft paper, so
    /// that entries inherited from prior terms are safe to apply once this one commits.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        if self.core.membership.members.len() == 1 {
            // No peers to replicate to; a single-node cluster commits immediately.
            let log_id = self.append_payload_to_log(crate::raft::EntryPayload::Blank).await?;
            self.core.commit_index = log_id.index;
            self.core.apply_committed_entries().await?;
            return Ok(());
        }
        self.append_payload_to_log(crate::raft::EntryPayload::Blank).await?;
        self.replicate_to_all_peers().await
    }

    /// Append a single entry locally, returning its assigned log id.
    async fn append_payload_to_log(&mut self, payload: crate::raft::EntryPayload<D>) -> RaftResult<LogId> {
        let log_id = LogId::new(self.core.current_term, self.core.last_log_id.index + 1);
        let entry = Entry { log_id, payload };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = log_id;
        Ok(log_id)
    }

    /// Handle a client write request: append the entry locally, fan it out to every peer, and
    /// reply only once it has been replicated to a majority and applied.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) -> RaftResult<()> {
        let log_id = match self.append_payload_to_log(rpc.entry).await {
            Ok(log_id) => log_id,
            Err(err) => {
                let _ = tx.send(Err(crate::error::ClientWriteError::RaftError(err.clone())));
                return Err(err);
            }
        };
        self.awaiting.insert(log_id.index, tx);

        if self.core.membership.members.len() == 1 {
            self.core.commit_index = log_id.index;
            self.apply_and_respond().await?;
            return Ok(());
        }

        self.replicate_to_all_peers().await
    }

    /// Confirm leadership with a quorum of peers before replying to a linearizable read, per
    /// the read-index protocol: a leader that can still hear from a majority is guaranteed no
    /// newer leader has since been elected.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        if self.nodes.is_empty() {
            let _ = tx.send(Ok(()));
            return;
        }

        let rpc = AppendEntriesRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
            prev_log_id: self.core.last_log_id,
            entries: vec![],
            leader_commit: self.core.commit_index,
        };
        let mut futures = FuturesUnordered::new();
        for &peer in self.nodes.keys() {
            let net = self.core.network.clone();
            let rpc = rpc.clone();
            futures.push(async move { net.send_append_entries(peer, rpc).await });
        }

        let needed = crate::quorum::majority_of(self.core.membership.members.len()) - 1;
        let mut confirmed = 0usize;
        while let Some(res) = futures.next().await {
            if let Ok(resp) = res {
                if resp.success {
                    confirmed += 1;
                    if confirmed >= needed {
                        let _ = tx.send(Ok(()));
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Err(crate::error::ClientReadError::QuorumNotReached));
    }

    /// Send AppendEntries to every peer in parallel, replicating any outstanding log suffix
    /// each one is missing, then advance the commit index by whatever a majority now has.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn replicate_to_all_peers(&mut self) -> RaftResult<()> {
        let mut futures = FuturesUnordered::new();
        for (&peer, repl) in self.nodes.iter() {
            let start = repl.next_index;
            let end = self.core.last_log_id.index;
            let entries = if start <= end {
                self.core.storage.get_log_entries(start..=end).await.map_err(|err| self.core.map_fatal_storage_error(err))?
            } else {
                vec![]
            };
            let prev_log_id = if start <= 1 {
                LogId::default()
            } else {
                match self.core.storage.try_get_log_entry(start - 1).await.map_err(|err| self.core.map_fatal_storage_error(err))? {
                    Some(e) => e.log_id,
                    None => LogId::default(),
                }
            };
            let entries = entries.into_iter().take(self.core.config.max_payload_entries as usize).collect::<Vec<_>>();
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id,
                entries,
                leader_commit: self.core.commit_index,
            };
            let net = self.core.network.clone();
            futures.push(async move {
                let res = net.send_append_entries(peer, rpc).await;
                (peer, res)
            });
        }

        while let Some((peer, res)) = futures.next().await {
            self.handle_append_entries_response(peer, res).await?;
        }
        self.leader_report_metrics();
        Ok(())
    }

    async fn handle_append_entries_response(&mut self, peer: NodeId, res: anyhow::Result<crate::raft::AppendEntriesResponse>) -> RaftResult<()> {
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!(error=?err, peer, "error sending AppendEntries RPC to peer");
                return Ok(());
            }
        };

        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        let repl = match self.nodes.get_mut(&peer) {
            Some(repl) => repl,
            None => return Ok(()),
        };

        if res.success {
            repl.next_index = self.core.last_log_id.index + 1;
            repl.match_index = repl.next_index - 1;
            self.leader_metrics.replication.insert(peer, LogId::new(self.core.current_term, repl.match_index));
            self.advance_commit_index().await?;
        } else if let Some(conflict) = res.conflict_opt {
            repl.next_index = conflict.index.max(1);
        } else {
            repl.next_index = repl.next_index.saturating_sub(1).max(1);
        }
        Ok(())
    }

    /// Advance `commit_index` to the highest index replicated to a majority of the cluster,
    /// honoring the current-term commit rule from §5.4.2: a leader may only directly advance
    /// its commit index to an entry from its own term. Entries from prior terms are committed
    /// only indirectly, once a later entry covering them also reaches a majority.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn advance_commit_index(&mut self) -> RaftResult<()> {
        let mut match_indexes: Vec<u64> = self.nodes.values().map(|r| r.match_index).collect();
        match_indexes.push(self.core.last_log_id.index);
        match_indexes.sort_unstable();
        let majority = crate::quorum::majority_of(self.core.membership.members.len());
        let candidate_index = match_indexes[match_indexes.len() - majority];

        if candidate_index <= self.core.commit_index {
            return Ok(());
        }
        let entry = self.core.storage.try_get_log_entry(candidate_index).await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        match entry {
            Some(entry) if entry.log_id.term == self.core.current_term => {}
            _ => return Ok(()),
        }

        self.core.commit_index = candidate_index;
        self.apply_and_respond().await
    }

    /// Apply every newly committed entry and resolve any client write waiting on it.
    async fn apply_and_respond(&mut self) -> RaftResult<()> {
        let applied = self.core.apply_committed_entries().await?;
        for (log_id, data) in applied {
            if let Some(tx) = self.awaiting.remove(&log_id.index) {
                let _ = tx.send(Ok(ClientWriteResponse { log_id, data }));
            }
        }
        Ok(())
    }
}
