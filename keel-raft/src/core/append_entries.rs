use anyhow::anyhow;
use tracing_futures::Instrument;

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // The leader of this term is now known; accept it and reset the election deadline.
        self.update_next_election_timeout();
        let mut report_metrics = false;

        // Update current term if needed.
        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        // Transition to follower state if needed.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        // Consistency check: the entry at `prev_log_id` must exist locally with a matching term.
        if !self.check_prev_log_entry(&msg).await? {
            if report_metrics {
                self.report_metrics(Update::Ignore);
            }
            // The hint is the highest index which can possibly match the leader's log: our own
            // last index when the leader probed past it, else just before the mismatch point.
            let hint_index = std::cmp::min(self.last_log_id.index, msg.prev_log_id.index.saturating_sub(1));
            let hint = self.log_id_hint(hint_index).await?;
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: Some(ConflictOpt { log_id: hint }),
            });
        }

        // The request is consistent with our log: fold in its entries, skipping those already
        // present and truncating on conflict.
        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        // Update the local commit index. It never regresses, and never passes the last entry
        // this node actually holds.
        let new_commit = std::cmp::min(msg.leader_commit, self.last_log_id.index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }
        self.replicate_to_state_machine_if_needed().await?;

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Check that the log entry preceding the request's entries exists locally with a matching
    /// term.
    async fn check_prev_log_entry(&mut self, msg: &AppendEntriesRequest<D>) -> RaftResult<bool> {
        // An index of 0 precedes every log.
        if msg.prev_log_id.index == 0 {
            return Ok(true);
        }
        // Entries inside the compacted prefix are committed, so they match by definition; at the
        // snapshot boundary the recorded term must agree.
        if msg.prev_log_id.index < self.snapshot_last_log_id.index {
            return Ok(true);
        }
        if msg.prev_log_id.index == self.snapshot_last_log_id.index {
            return Ok(msg.prev_log_id.term == self.snapshot_last_log_id.term);
        }
        if msg.prev_log_id.index > self.last_log_id.index {
            return Ok(false);
        }
        let entry = self
            .storage
            .try_get_log_entry(msg.prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(matches!(entry, Some(e) if e.log_id.term == msg.prev_log_id.term))
    }

    /// Produce a log id for the given local index, best-effort on the term.
    async fn log_id_hint(&mut self, index: u64) -> RaftResult<LogId> {
        if index == 0 {
            return Ok(LogId::default());
        }
        if index == self.snapshot_last_log_id.index {
            return Ok(self.snapshot_last_log_id);
        }
        let entry = self
            .storage
            .try_get_log_entry(index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(match entry {
            Some(e) => e.log_id,
            // Compacted away; the leader will fall back to snapshot replication.
            None => LogId { term: 0, index },
        })
    }

    /// Append the given entries to the log, resolving overlaps and conflicts (§5.3).
    ///
    /// Entries already present with a matching term are skipped. The first conflicting entry
    /// causes the local suffix from that index on to be truncated — which is only legal above
    /// the commit index — before the remainder is appended.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let mut skip = 0;
        for entry in entries.iter() {
            let index = entry.log_id.index;
            // Entries covered by the snapshot are committed and identical.
            if index <= self.snapshot_last_log_id.index {
                skip += 1;
                continue;
            }
            if index > self.last_log_id.index {
                break;
            }
            let existing = self
                .storage
                .try_get_log_entry(index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(local) if local.log_id.term == entry.log_id.term => {
                    skip += 1;
                }
                Some(local) => {
                    // Conflict: discard our suffix from this point. Truncating at or below the
                    // commit index would overwrite committed data, which must never happen.
                    if index <= self.commit_index {
                        return Err(self.map_fatal_storage_error(anyhow!(
                            "append entries conflict at index {} at or below commit index {} (local term {}, leader term {})",
                            index,
                            self.commit_index,
                            local.log_id.term,
                            entry.log_id.term,
                        )));
                    }
                    self.storage.delete_logs_from(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
                    self.last_log_id = self.log_id_hint(index - 1).await?;
                    // The truncated suffix may have carried a configuration entry; fall back to
                    // the latest one still in the log.
                    let (membership, membership_index) =
                        self.storage.get_membership().await.map_err(|err| self.map_fatal_storage_error(err))?;
                    self.update_membership(membership, membership_index);
                    break;
                }
                None => break,
            }
        }
        let entries = &entries[skip..];
        if entries.is_empty() {
            return Ok(());
        }

        // Check the given entries for any config changes and take the most recent.
        let last_conf_change = entries
            .iter()
            .filter_map(|ent| match &ent.payload {
                EntryPayload::ConfigChange(conf) => Some((conf, ent.log_id.index)),
                _ => None,
            })
            .last();

        let entry_refs = entries.iter().collect::<Vec<_>>();
        self.storage.append_to_log(&entry_refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = entries.last() {
            self.last_log_id = entry.log_id;
        }

        // Configurations take effect at append time, for followers as for leaders.
        if let Some((conf, index)) = last_conf_change {
            tracing::debug!({membership=?conf}, "applying new membership config received from leader");
            self.update_membership(conf.membership.clone(), index);
        }

        Ok(())
    }

    /// Replicate any outstanding entries to the state machine for which it is safe to do so.
    ///
    /// Very importantly, this routine must not block the main control loop main task, else it
    /// may cause the Raft leader to timeout the requests to this node.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn replicate_to_state_machine_if_needed(&mut self) -> RaftResult<()> {
        tracing::debug!("replicate_to_sm_if_needed: last_applied: {}", self.last_applied);

        // Perform initial replication to state machine if needed.
        if !self.has_completed_initial_replication_to_sm {
            // Optimistic update, as failures will cause shutdown.
            self.has_completed_initial_replication_to_sm = true;
            self.initial_replicate_to_state_machine().await;
            return Ok(());
        }

        // If we already have an active replication task, then do nothing.
        if !self.replicate_to_sm_handle.is_empty() {
            return Ok(());
        }

        // If we don't have any new entries to replicate, then do nothing.
        if self.commit_index <= self.last_applied.index {
            return Ok(());
        }

        let entries = self
            .storage
            .get_log_entries(self.last_applied.index + 1..=self.commit_index)
            .await
            .map_err(|e| self.map_fatal_storage_error(e))?;

        let last_log_id = entries.last().map(|x| x.log_id);

        tracing::debug!("entries: {:?}", entries.iter().map(|x| x.log_id).collect::<Vec<_>>());

        // If we have no data entries to apply, then do nothing.
        if entries.is_empty() {
            if let Some(log_id) = last_log_id {
                self.last_applied = log_id;
                self.report_metrics(Update::Ignore);
            }
            return Ok(());
        }

        // Spawn task to replicate these entries to the state machine.
        // Linearizability is guaranteed by `replicate_to_sm_handle`, which is the mechanism used
        // to ensure that only a single task can replicate data to the state machine, and that is
        // owned by a single task, not shared between multiple threads/tasks.
        let storage = self.storage.clone();
        let handle = tokio::spawn(
            async move {
                let entries_refs: Vec<_> = entries.iter().collect();
                storage.apply_to_state_machine(&entries_refs).await?;
                Ok(last_log_id)
            }
            .instrument(tracing::debug_span!("spawn")),
        );
        self.replicate_to_sm_handle.push(handle);

        Ok(())
    }

    /// Perform an initial replication of outstanding entries to the state machine.
    ///
    /// This will only be executed once, and only in response to its first payload of entries
    /// from the AppendEntries RPC handler.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn initial_replicate_to_state_machine(&mut self) {
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index) + 1;
        let start = self.last_applied.index + 1;
        let storage = self.storage.clone();

        // If we already have an active replication task, then do nothing.
        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }

        if start >= stop {
            return;
        }

        // Fetch the series of entries which must be applied to the state machine, then apply them.
        let handle = tokio::spawn(
            async move {
                let mut new_last_applied: Option<LogId> = None;
                let entries = storage.get_log_entries(start..stop).await?;
                if let Some(entry) = entries.last() {
                    new_last_applied = Some(entry.log_id);
                }
                let data_entries: Vec<_> = entries.iter().collect();
                if data_entries.is_empty() {
                    return Ok(new_last_applied);
                }
                storage.apply_to_state_machine(&data_entries).await?;
                Ok(new_last_applied)
            }
            .instrument(tracing::debug_span!("spawn-init-replicate-to-sm")),
        );
        self.replicate_to_sm_handle.push(handle);
    }
}
