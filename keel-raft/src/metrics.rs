//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use cases are to expose
//! these metrics to a metrics collection system, or to trigger events within the parent
//! application. The [`Wait`] helper builds small state machines on top of the metrics stream and
//! is used pervasively by the test harness.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::core::State;
use crate::membership::Membership;
use crate::replication::ReplicationMetrics;
use crate::LogId;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: Membership,
    /// The id of the last log included in the most recent snapshot.
    pub snapshot: LogId,
    /// The metrics about the leader. It is `None` if this node is not leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

/// The metrics about the leader. It is `None` if this node is not leader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of all known replication targets.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::NonVoter,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: Membership::default(),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

/// Error variants from waiting for metrics to satisfy a condition.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait for metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy the condition defined by `func`.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {} metrics: {:?}", msg, latest);
                return Ok(latest);
            }

            let delay = sleep_until(deadline);
            tokio::select! {
                _ = delay => {
                    tracing::debug!("wait timeout: {}", msg);
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| WaitError::ShuttingDown)?;
                }
            }
        }
    }

    /// Wait for `last_log_index` and `last_applied` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index == want_log && x.last_applied == want_log,
            &format!("{} .last_log_index&last_applied -> {}", msg, want_log),
        )
        .await
    }

    /// Wait for `last_applied` to reach or pass `want`.
    pub async fn applied_at_least(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.last_applied >= want, &format!("{} .last_applied >= {}", msg, want)).await
    }

    /// Wait for the node state to become `want_state`.
    pub async fn state(&self, want_state: State, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.state == want_state, &format!("{} .state -> {:?}", msg, want_state)).await
    }

    /// Wait for `current_leader` to become `leader_id`.
    pub async fn current_leader(&self, leader_id: NodeId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg, leader_id),
        )
        .await
    }

    /// Wait for the last snapshot to cover `want`.
    pub async fn snapshot(&self, want: LogId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.snapshot == want, &format!("{} .snapshot -> {:?}", msg, want)).await
    }
}
