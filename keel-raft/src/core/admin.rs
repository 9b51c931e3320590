use tokio::time::Instant;

use crate::core::client::ClientRequestEntry;
use crate::core::CatchUpState;
use crate::core::ChangeState;
use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::ResponseError;
use crate::membership::Membership;
use crate::membership::Role;
use crate::raft::EntryConfigChange;
use crate::raft::EntryPayload;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Check that a new configuration change may start.
    ///
    /// At most one change may be in flight at any time: the single-slot lock covers an
    /// uncommitted configuration entry, an in-progress promotion catch-up, and — since
    /// configurations take effect on append — any uncommitted configuration found in the log
    /// (for instance one inherited from a previous leader).
    fn can_change_configuration(&self) -> Result<(), ChangeConfigError> {
        if self.transfer.is_some() {
            return Err(ChangeConfigError::NodeNotLeader(Some(self.core.id)));
        }
        if self.change.is_some() || self.promotee.is_some() {
            return Err(ChangeConfigError::ConfigChangeInProgress);
        }
        if self.core.membership_index > self.core.commit_index {
            return Err(ChangeConfigError::ConfigChangeInProgress);
        }
        Ok(())
    }

    /// Add a new server to the cluster configuration, in the spare role (§6).
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target=id))]
    pub(super) async fn add_server(&mut self, id: NodeId, address: String, tx: ResponseTx) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err.into()));
            return;
        }
        let membership = match self.core.membership.with_server_added(id, &address) {
            Ok(membership) => membership,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        };
        self.append_membership_log(membership, tx).await;
    }

    /// Assign a new role to a server of the cluster configuration (§6).
    ///
    /// Promotions to voter go through catch-up rounds unless the target's log is already
    /// up-to-date; any other role change is appended immediately.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target=id, role=%role))]
    pub(super) async fn assign_role(&mut self, id: NodeId, role: Role, tx: ResponseTx) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err.into()));
            return;
        }
        let server = match self.core.membership.get(id) {
            Some(server) => server,
            None => {
                let _ = tx.send(Err(ChangeConfigError::NotFound(id).into()));
                return;
            }
        };
        if server.role == role {
            let _ = tx.send(Err(ChangeConfigError::BadRole { role }.into()));
            return;
        }

        // If we are not promoting to the voter role, or if the log of the target server is
        // already up-to-date, the configuration change is submitted immediately.
        let up_to_date = self
            .nodes
            .get(&id)
            .map(|node| node.matched.index == self.core.last_log_id.index)
            .unwrap_or(false);
        if role != Role::Voter || up_to_date {
            let membership = self.core.membership.with_role(id, role);
            self.append_membership_log(membership, tx).await;
            return;
        }

        // Otherwise enter catch-up: the promotion is appended only once the target has
        // replicated the leader's log within a bounded round.
        tracing::debug!(promotee = id, "starting catch-up rounds for promotion to voter");
        self.promotee = Some(CatchUpState {
            id,
            round_number: 1,
            round_index: self.core.last_log_id.index,
            round_start: Instant::now(),
            tx,
        });
    }

    /// Remove a server from the cluster configuration (§6).
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target=id))]
    pub(super) async fn remove_server(&mut self, id: NodeId, tx: ResponseTx) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err.into()));
            return;
        }
        if self.core.membership.get(id).is_none() {
            let _ = tx.send(Err(ChangeConfigError::BadId(id).into()));
            return;
        }

        if id == self.core.id {
            // A leader removing itself keeps leading until the entry commits, then steps down.
            self.is_stepping_down = true;
        }
        let membership = self.core.membership.with_server_removed(id);
        self.append_membership_log(membership, tx).await;
    }

    /// Append a configuration entry to the log and begin replicating it.
    ///
    /// The new configuration takes effect immediately upon being appended: quorum and election
    /// decisions from here on use it. Replication streams are reconciled right away so that a
    /// newly added server starts receiving entries (including this very configuration entry),
    /// while removed servers keep their stream alive until the entry commits.
    #[tracing::instrument(level = "trace", skip(self, tx), fields(id=self.core.id))]
    pub(super) async fn append_membership_log(&mut self, membership: Membership, tx: ResponseTx) {
        let payload = EntryPayload::ConfigChange(EntryConfigChange {
            membership: membership.clone(),
        });
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(ResponseError::Raft(err)));
                return;
            }
        };
        let index = entry.log_id.index;

        self.core.update_membership(membership, index);

        // Spawn replication streams for servers new to the configuration.
        let new_targets: Vec<_> = self
            .core
            .membership
            .all_ids()
            .into_iter()
            .filter(|id| id != &self.core.id && !self.nodes.contains_key(id))
            .collect();
        for target in new_targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.change = Some(ChangeState { index, tx });

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;
    }

    /// Handle the commitment of a configuration change entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_config_change_committed(&mut self, index: u64) {
        if let Some(change) = self.change.take() {
            if change.index == index {
                let _ = change.tx.send(Ok(index));
            } else {
                self.change = Some(change);
            }
        }

        // A leader which removed itself steps down once the removing entry is committed.
        if self.is_stepping_down && !self.core.membership.contains(self.core.id) {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::NonVoter);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Replication streams for servers which are no longer cluster members are shut down
        // once the target has replicated the config which removes it; targets which have not
        // yet replicated it are marked for removal.
        let membership = &self.core.membership;
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !membership.contains(**id))
            .filter_map(|(id, replstate)| {
                if replstate.matched.index >= index {
                    Some(*id)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();

        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }
        self.leader_report_metrics();
    }

    /// Drive the catch-up rounds of a server being promoted to voter (§4.2.1 of the
    /// dissertation).
    ///
    /// Invoked whenever the promotee's match index advances. A round ends when the promotee
    /// reaches the round's target index; if it got there within the minimum election timeout it
    /// is considered caught up and the promoting configuration is appended, otherwise a new
    /// round starts from the leader's current last index, up to the configured round budget.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn check_promotee_progress(&mut self, target: NodeId, matched_index: u64) {
        let promotee = match &mut self.promotee {
            Some(promotee) if promotee.id == target => promotee,
            _ => return,
        };
        if matched_index < promotee.round_index {
            return;
        }

        let elapsed = promotee.round_start.elapsed();
        let round_budget = std::time::Duration::from_millis(self.core.config.election_timeout_min);
        if elapsed <= round_budget {
            // Caught up: submit the promoting configuration.
            let promotee = self.promotee.take().expect("promotee checked above");
            tracing::debug!(
                promotee = promotee.id,
                rounds = promotee.round_number,
                "promotee caught up, appending voter configuration"
            );
            let membership = self.core.membership.with_role(promotee.id, Role::Voter);
            self.append_membership_log(membership, promotee.tx).await;
            return;
        }

        if promotee.round_number >= self.core.config.max_catch_up_rounds {
            let promotee = self.promotee.take().expect("promotee checked above");
            tracing::warn!(
                promotee = promotee.id,
                rounds = promotee.round_number,
                "promotee failed to catch up within the round budget"
            );
            let _ = promotee.tx.send(Err(ChangeConfigError::CatchUpFailed {
                id: promotee.id,
                rounds: promotee.round_number,
            }
            .into()));
            return;
        }

        // The round was won too slowly; start another one from the current last index.
        promotee.round_number += 1;
        promotee.round_index = self.core.last_log_id.index;
        promotee.round_start = Instant::now();
    }
}
