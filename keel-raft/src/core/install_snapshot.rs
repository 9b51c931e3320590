use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to install a snapshot on a follower (§7).
    ///
    /// The snapshot arrives complete in a single request. The receiver persists it, discards
    /// its log, restores its state machine from the payload, and installs the configuration
    /// carried in the snapshot metadata — all before replying, so a successful reply means the
    /// installation is durable.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout();

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower); // State update will emit metrics.
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // A snapshot which is not ahead of the one already held is a no-op success: everything
        // it covers is already durable here.
        if req.meta.last_log_id.index <= self.snapshot_last_log_id.index {
            tracing::debug!(
                local=%self.snapshot_last_log_id, received=%req.meta.last_log_id,
                "received stale snapshot, ignoring"
            );
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // A local compaction in progress is superseded by the leader's snapshot.
        if let Some(SnapshotState::Snapshotting { handle, .. }) = self.snapshot_state.take() {
            handle.abort();
        }

        // Write the snapshot payload and hand it to storage for installation.
        let mut snapshot =
            self.storage.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await?;
        snapshot.as_mut().shutdown().await?;

        self.storage
            .finalize_snapshot_installation(&req.meta, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // The snapshot replaces the log wholesale, and its effects are by definition committed
        // and applied. The configuration carried in the metadata is installed as the current
        // one.
        self.last_log_id = req.meta.last_log_id;
        self.commit_index = req.meta.last_log_id.index;
        self.last_applied = req.meta.last_log_id;
        self.snapshot_last_log_id = req.meta.last_log_id;
        self.update_membership(req.meta.membership.clone(), req.meta.membership_index);
        self.report_metrics(Update::Ignore);

        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }
}
