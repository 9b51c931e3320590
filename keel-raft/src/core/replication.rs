use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::quorum;
use crate::replication::ProgressState;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_replication_stream(&mut self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            state: ProgressState::Probe,
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        let res = match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => self.handle_update_match_index(target, matched).await,
            ReplicaEvent::ProgressUpdate { target, state } => self.handle_progress_update(target, state),
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                Ok(())
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle a `ProgressUpdate` event: a replication stream has changed state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_progress_update(&mut self, target: NodeId, state: ProgressState) -> anyhow::Result<()> {
        if let Some(node) = self.nodes.get_mut(&target) {
            node.state = state;
        }
        Ok(())
    }

    /// Handle an `UpdateMatchIndex` event: the target has replicated up through `matched`.
    ///
    /// The progress table is monotonic, which makes replies reordered by the network idempotent.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> anyhow::Result<()> {
        // Responses from servers which have been removed are ignored.
        let node = match self.nodes.get_mut(&target) {
            Some(node) => node,
            None => return Ok(()),
        };
        if matched.index <= node.matched.index {
            return Ok(());
        }
        node.matched = matched;

        // A target which is no longer a member shuts down once it has replicated the config
        // entry which removed it.
        let remove = matches!(node.remove_after_commit, Some(idx) if matched.index >= idx);
        if remove {
            tracing::debug!(target, "removed target has replicated its removal, shutting down its stream");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        } else {
            self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
        }

        // Drive any promotion catch-up and pending leadership transfer for this target.
        self.check_promotee_progress(target, matched.index).await;
        self.check_transfer_progress(target);

        // Attempt to advance the commit index.
        let new_commit = self.calc_commit_index();
        if new_commit > self.core.commit_index {
            // Per §5.4.2, a leader only commits by counting replicas of an entry of its own
            // term; earlier entries are then committed indirectly.
            let entry = self
                .core
                .storage
                .try_get_log_entry(new_commit)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            let same_term = matches!(entry, Some(e) if e.log_id.term == self.core.current_term);
            if same_term {
                self.core.commit_index = new_commit;
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((
                        RaftEvent::UpdateCommitIndex {
                            commit_index: self.core.commit_index,
                        },
                        tracing::debug_span!("CH"),
                    ));
                }
                self.process_awaiting_committed().await;
            }
        }

        self.leader_report_metrics();
        Ok(())
    }

    /// The highest log index replicated on a quorum of the voters of the current configuration.
    ///
    /// The leader's own log counts when the leader is itself a voter.
    fn calc_commit_index(&self) -> u64 {
        let mut indexes: Vec<u64> = self
            .core
            .membership
            .voters()
            .map(|server| {
                if server.id == self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.nodes.get(&server.id).map(|node| node.matched.index).unwrap_or(0)
                }
            })
            .collect();
        if indexes.is_empty() {
            return 0;
        }
        let needed = quorum::majority_of(indexes.len());
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[needed - 1]
    }

    /// Complete client requests whose entries have been committed, in index order.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn process_awaiting_committed(&mut self) {
        while let Some(first) = self.awaiting_committed.first() {
            if first.entry.log_id.index > self.core.commit_index {
                break;
            }
            let req = self.awaiting_committed.remove(0);
            self.client_request_post_commit(req).await;
        }
    }

    /// Handle a `RevertToFollower` event: a replication stream observed a greater term.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> anyhow::Result<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle a `NeedsSnapshot` event: a replication stream requires a snapshot to send.
    ///
    /// If a current snapshot exists it is handed over directly. Otherwise a compaction is
    /// started (or the running one joined) and a waiter task delivers the snapshot once it is
    /// ready; the replication stream keeps heartbeating in the meantime.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        target: NodeId,
        tx: tokio::sync::oneshot::Sender<Snapshot<S::SnapshotData>>,
    ) -> anyhow::Result<()> {
        // Check for existence of current snapshot.
        let current_snapshot_opt =
            self.core.storage.get_current_snapshot().await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        if let Some(snapshot) = current_snapshot_opt {
            let _ = tx.send(snapshot);
            return Ok(());
        }

        // No snapshot exists: ensure a compaction is running and defer the response.
        if self.core.snapshot_state.is_none() {
            self.core.trigger_log_compaction_if_needed(true);
        }
        match &self.core.snapshot_state {
            Some(SnapshotState::Snapshotting { sender, .. }) => {
                let mut compaction_rx = sender.subscribe();
                let storage = self.core.storage.clone();
                tokio::spawn(
                    async move {
                        // The compaction channel drops without a value if compaction failed;
                        // the replication stream will simply ask again.
                        if compaction_rx.recv().await.is_ok() {
                            if let Ok(Some(snapshot)) = storage.get_current_snapshot().await {
                                let _ = tx.send(snapshot);
                            }
                        }
                    }
                    .instrument(tracing::debug_span!("waiting for log compaction to complete", target = target)),
                );
            }
            None => {
                // Compaction could not start (e.g. nothing applied yet); drop the request so
                // the replication stream retries.
                tracing::warn!(target, "snapshot requested but no compaction could be started");
            }
        }
        Ok(())
    }
}
