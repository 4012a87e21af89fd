use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::storage::LogStore;
use crate::writer::WriteCommand;
use crate::LogId;
use crate::MessageSummary;
use crate::RaftNetwork;

impl<N: RaftNetwork, S: LogStore> RaftCore<N, S> {
    /// An RPC invoked by the leader to replicate log entries; also used as a heartbeat.
    ///
    /// The request is accepted iff its term is current and this node's
    /// log contains the entry at `prev_log_id`; a mismatch is answered
    /// with a conflict hint so the leader can resynchronize in few
    /// round-trips.
    #[tracing::instrument(level="debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        rpc: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if rpc.term < self.current_term {
            tracing::debug!({ self.current_term, rpc_term = rpc.term }, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // Two nodes can believe themselves leader of the same term for a
        // moment while the membership view converges after a cold start;
        // the lower node ID keeps the lead, deterministically.
        if rpc.term == self.current_term && self.target_state == State::Leader && rpc.leader_id > self.id {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != rpc.term {
            self.update_current_term(rpc.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(rpc.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id));
            report_metrics = true;
        }

        // Transition to follower state if needed.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        // Check the consistency of the log: this node's entry at
        // `prev_log_id` must match the leader's.
        if rpc.prev_log_id.index > 0 {
            if self.last_log_id.index < rpc.prev_log_id.index {
                // This node's log is too short; the leader backs up to our
                // last entry.
                if report_metrics {
                    self.report_metrics(crate::Update::Ignore);
                }
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(ConflictOpt { log_id: self.last_log_id }),
                });
            }

            let local = self
                .storage
                .try_get_log_entry(rpc.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let matches = local.as_ref().map(|e| e.log_id.term == rpc.prev_log_id.term).unwrap_or(false);
            if !matches {
                // Terms diverge at prev_log_id: drop the conflicting
                // suffix and point the leader at the last entry we keep.
                let keep_through = rpc.prev_log_id.index - 1;
                self.truncate_log_from(rpc.prev_log_id.index).await?;
                let conflict = self.log_id_at(keep_through).await?;
                if report_metrics {
                    self.report_metrics(crate::Update::Ignore);
                }
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(ConflictOpt { log_id: conflict }),
                });
            }
        }

        // The log is consistent through `prev_log_id`; persist any novel
        // entries.
        if !rpc.entries.is_empty() {
            self.append_novel_entries(&rpc).await?;
            report_metrics = true;
        }

        // Update the commit index: everything the leader has committed
        // which is covered by our log may be applied.
        let last_new_entry = rpc.entries.last().map(|e| e.log_id.index).unwrap_or(rpc.prev_log_id.index);
        if rpc.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(rpc.leader_commit, last_new_entry).max(self.commit_index);
            self.trigger_apply_to_state_machine();
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics(crate::Update::Ignore);
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Append the entries of the request which are not already present,
    /// discarding any conflicting suffix first.
    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn append_novel_entries(&mut self, rpc: &AppendEntriesRequest) -> RaftResult<()> {
        let mut to_append: Vec<Entry> = Vec::with_capacity(rpc.entries.len());
        for entry in &rpc.entries {
            if !to_append.is_empty() || entry.log_id.index > self.last_log_id.index {
                to_append.push(entry.clone());
                continue;
            }
            // The index is already present locally; retransmissions of
            // entries we hold are skipped, conflicts evict the suffix.
            let local = self
                .storage
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match local {
                Some(existing) if existing.log_id == entry.log_id => continue,
                _ => {
                    self.truncate_log_from(entry.log_id.index).await?;
                    to_append.push(entry.clone());
                }
            }
        }

        if let Some(last) = to_append.last() {
            let last_log_id = last.log_id;
            self.writer
                .submit(WriteCommand::AppendEntries(to_append))
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = last_log_id;
        }
        Ok(())
    }

    /// Drop the log suffix starting at `index`.
    async fn truncate_log_from(&mut self, index: u64) -> RaftResult<()> {
        self.writer
            .submit(WriteCommand::TruncateFrom(index))
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if self.last_log_id.index >= index {
            self.last_log_id = self.log_id_at(index.saturating_sub(1)).await?;
        }
        Ok(())
    }

    /// The log id of the entry at `index`, or the zero id for index 0.
    async fn log_id_at(&mut self, index: u64) -> RaftResult<LogId> {
        if index == 0 {
            return Ok(LogId { term: 0, index: 0 });
        }
        let entry = self
            .storage
            .try_get_log_entry(index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(entry.map(|e| e.log_id).unwrap_or(LogId { term: 0, index: 0 }))
    }
}
