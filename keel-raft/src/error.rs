//! Error types exposed by this crate.

use thiserror::Error;

use crate::membership::Role;
use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
    /// An IO error which has come from interacting with snapshot data.
    #[error("{0}")]
    IO(#[from] std::io::Error),
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client request must be forwarded to the cluster leader.
    #[error("the client request must be forwarded to the cluster leader")]
    ForwardToLeader(D, Option<NodeId>),
    /// The request was canceled before it could be committed.
    #[error("the client request was canceled")]
    Canceled,
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, Error)]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The cluster is already undergoing a configuration change.
    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,
    /// The node the config change was submitted to is not the Raft leader.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// The given server ID is invalid for the requested operation.
    #[error("invalid server id {0}")]
    BadId(NodeId),
    /// No server with the given ID exists in the cluster configuration.
    #[error("no server has id {0}")]
    NotFound(NodeId),
    /// The target server already has the requested role.
    #[error("server is already {role}")]
    BadRole { role: Role },
    /// The server being promoted to voter failed to catch up with the leader's log.
    #[error("server {id} failed to catch up after {rounds} rounds")]
    CatchUpFailed { id: NodeId, rounds: u64 },
}

/// The set of errors which may take place when requesting a leadership transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node the transfer was submitted to is not the Raft leader, or a transfer is already
    /// in progress.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// There is no other voting server to transfer leadership to.
    #[error("there is no other voting server")]
    NotFound,
    /// The given server is not a voter of the current configuration, or is this node itself.
    #[error("server {0} can not receive leadership")]
    BadId(NodeId),
    /// The transfer window expired before the target assumed leadership.
    #[error("the leadership transfer timed out")]
    Timeout,
}

/// A response error for requests which resolve to a log index.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error(transparent)]
    Raft(#[from] RaftError),
    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
    /// The node is not the Raft leader; the value carries the current leader, if known.
    #[error("this node is not the Raft leader")]
    NotLeader(Option<NodeId>),
    /// The request was canceled before it could complete.
    #[error("the request was canceled")]
    Canceled,
}

/// Error variants related to configuration validation.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeouts do not form a valid range.
    #[error("given values for election timeout min & max do not form a valid range")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be less than the minimum election timeout.
    #[error("the heartbeat interval must be less than the minimum election timeout")]
    InvalidHeartbeatInterval,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
    /// The given value for snapshot_trailing is too small, must be > 0.
    #[error("the given value for snapshot_trailing is too small, must be > 0")]
    SnapshotTrailingTooSmall,
    /// The given value for max_catch_up_rounds is too small, must be > 0.
    #[error("the given value for max_catch_up_rounds is too small, must be > 0")]
    MaxCatchUpRoundsTooSmall,
}
