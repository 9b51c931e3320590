use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::TransferState;
use crate::error::RaftResult;
use crate::error::TransferError;
use crate::raft::TimeoutNowRequest;
use crate::raft::TimeoutNowResponse;
use crate::raft::TransferTx;
use crate::replication::ProgressState;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by a leader transferring its leadership away.
    ///
    /// An up-to-date voter which receives this starts campaigning immediately, without waiting
    /// for its election timeout. Non-voters and nodes already campaigning or leading ignore it.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_timeout_now_request(&mut self, msg: TimeoutNowRequest) -> RaftResult<TimeoutNowResponse> {
        if msg.term < self.current_term {
            return Ok(TimeoutNowResponse {
                term: self.current_term,
            });
        }
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            self.set_target_state(State::Follower);
        }

        if self.target_state.is_follower() && self.membership.is_voter(self.id) {
            tracing::debug!(from = msg.leader_id, "received TimeoutNow, starting election immediately");
            self.set_target_state(State::Candidate);
        }

        Ok(TimeoutNowResponse {
            term: self.current_term,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Begin transferring leadership to the given voter, or to the most up-to-date voter when
    /// `target` is `0`.
    ///
    /// The transferee is recorded right away, even when its log is not yet up-to-date; the
    /// TimeoutNow frame fires from the progress-update path once it has caught up. The transfer
    /// window closes after the maximum election timeout regardless, so a target which never
    /// catches up fails the request rather than wedging the leader.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn transfer_leadership(&mut self, target: NodeId, tx: TransferTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(TransferError::NodeNotLeader(Some(self.core.id))));
            return;
        }

        let target = if target == 0 {
            match self.select_transferee() {
                Some(id) => id,
                None => {
                    let _ = tx.send(Err(TransferError::NotFound));
                    return;
                }
            }
        } else {
            target
        };

        let valid = target != self.core.id && self.core.membership.is_voter(target);
        if !valid {
            let _ = tx.send(Err(TransferError::BadId(target)));
            return;
        }

        let deadline = Instant::now() + Duration::from_millis(self.core.config.election_timeout_max);
        self.transfer = Some(TransferState {
            target,
            deadline,
            tx,
            timeout_now_sent: false,
        });

        if self.progress_is_up_to_date(target) {
            self.send_timeout_now(target);
        }
    }

    /// Find a suitable voting follower to transfer leadership to: the one with the most
    /// replicated log, preferring targets not currently installing a snapshot.
    fn select_transferee(&self) -> Option<NodeId> {
        self.core
            .membership
            .voters()
            .filter(|server| server.id != self.core.id)
            .max_by_key(|server| {
                self.nodes
                    .get(&server.id)
                    .map(|node| (node.state != ProgressState::Snapshot, node.matched.index))
                    .unwrap_or((false, 0))
            })
            .map(|server| server.id)
    }

    /// Check whether the target's replicated log has reached the leader's last index.
    fn progress_is_up_to_date(&self, target: NodeId) -> bool {
        self.nodes
            .get(&target)
            .map(|node| node.matched.index >= self.core.last_log_id.index)
            .unwrap_or(false)
    }

    /// Fire the TimeoutNow frame at the transfer target once it is up-to-date.
    ///
    /// Invoked from the progress-update path; a no-op unless a transfer is pending for this
    /// exact target and the frame has not been sent yet.
    pub(super) fn check_transfer_progress(&mut self, target: NodeId) {
        let ready = match &self.transfer {
            Some(transfer) => {
                transfer.target == target && !transfer.timeout_now_sent && self.progress_is_up_to_date(target)
            }
            None => false,
        };
        if ready {
            self.send_timeout_now(target);
        }
    }

    /// Send a TimeoutNow frame to the target, marking the transfer as fired.
    fn send_timeout_now(&mut self, target: NodeId) {
        if let Some(transfer) = &mut self.transfer {
            transfer.timeout_now_sent = true;
        }
        let rpc = TimeoutNowRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
        };
        let network = self.core.network.clone();
        tokio::spawn(
            async move {
                if let Err(err) = network.send_timeout_now(target, rpc).await {
                    tracing::warn!({error=%err, target}, "error sending TimeoutNow to transfer target");
                }
            }
            .instrument(tracing::debug_span!("sending TimeoutNow", target = target)),
        );
        tracing::debug!(target, "sent TimeoutNow to transfer target");
    }

    /// Abandon an expired leadership transfer and resume normal operation.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn handle_transfer_timeout(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            tracing::warn!(target = transfer.target, "leadership transfer window expired, resuming leadership");
            let _ = transfer.tx.send(Err(TransferError::Timeout));
        }
    }
}
