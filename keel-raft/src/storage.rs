//! The Raft storage interface and data types.

use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::membership::Membership;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// The metadata of a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// The log id of the last entry whose effect is captured in the snapshot, inclusive.
    pub last_log_id: LogId,
    /// The latest membership configuration covered by the snapshot.
    pub membership: Membership,
    /// The log index at which `membership` was appended.
    pub membership_index: u64,
}

/// The data associated with the current snapshot.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// Metadata of the snapshot.
    pub meta: SnapshotMeta,
    /// A read handle to the associated snapshot payload.
    pub snapshot: Box<S>,
}

/// A record holding the hard state of a Raft node.
///
/// Both fields must be made durable before any response that would bind them is sent.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The id of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership configuration found in the log or snapshot, else an empty
    /// configuration for a pristine node.
    pub membership: Membership,
    /// The log index at which `membership` was appended; `0` for a pristine node.
    pub membership_index: u64,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
            membership: Membership::default(),
            membership_index: 0,
        }
    }
}

/// An error indicating that a log read touched indices discarded by log compaction.
///
/// Storage implementations return this (through `anyhow`) from log reads covering entries at or
/// below the last compacted index; the engine's replication layer downcasts to it in order to
/// fall back to snapshot installation.
#[derive(Debug, Error)]
#[error("log range compacted at or below index {upto}")]
pub struct CompactedRange {
    /// The highest compacted log index.
    pub upto: u64,
}

/// A trait defining the interface for a Raft storage system.
///
/// The implementation owns both the durable log and the application state machine: command
/// entries committed by the cluster are handed to `apply_to_state_machine`, and snapshots are
/// captured from / restored into the state machine through the compaction and installation
/// methods.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// The error type used to indicate to Raft that shutdown is needed when calling the
    /// `apply_to_state_machine` method.
    ///
    /// This error type is only considered for the `apply_to_state_machine` method as it is
    /// the only method which is allowed to return errors normally as part of application logic.
    ///
    /// For all other methods of this trait, returning an error will cause Raft to shutdown.
    type ShutdownError: Error + Send + Sync + 'static;

    /// Get the latest membership config found in the log or snapshot, along with the log index
    /// at which it was appended.
    ///
    /// This must always be implemented as a reverse search through the log to find the most
    /// recent membership config to be appended to the log, falling back to the config stored in
    /// the current snapshot's metadata, and to an empty config for a pristine store.
    async fn get_membership(&self) -> Result<(Membership, u64)>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such data exists due to this being
    /// the first time the node has come online, then `InitialState::new_initial` should be used.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Bootstrap a pristine store with the given initial cluster configuration.
    ///
    /// This writes hard state for term 1 and a configuration entry at index 1 term 1, exactly as
    /// if that entry had been replicated through the normal protocol. It must fail if the store
    /// already holds any log entries or hard state. Every member of a new cluster must be
    /// bootstrapped with the same configuration before being started.
    async fn bootstrap(&self, membership: Membership) -> Result<()>;

    /// Forcibly append the given configuration to the log of a stopped node.
    ///
    /// This is a disaster-recovery hook: when a majority of the cluster is permanently lost, the
    /// remaining nodes can be recovered with a configuration containing only the survivors. It
    /// must never be used on a running cluster.
    async fn recover(&self, membership: Membership) -> Result<()>;

    /// Save Raft's hard-state, durably, before returning.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive:
    /// `[start, stop)`. Reads touching compacted indices fail with [`CompactedRange`].
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry. Returns `Ok(None)` if the entry is absent or compacted.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Delete all log entries with index `>= start`.
    ///
    /// This is only ever invoked by followers resolving a log conflict; the engine guarantees
    /// `start` is greater than its commit index. Truncating at a point past the end of the log
    /// is a no-op.
    async fn delete_logs_from(&self, start: u64) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// The append must be atomic and durable: across a crash, either all of the given entries
    /// are present or none of them are.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Apply the given payload of committed entries to the state machine, in order.
    ///
    /// This is where the business logic of interacting with the application's state machine
    /// lives. Barrier and configuration entries are delivered here as well so that the state
    /// machine's applied index stays dense; implementations return a default response for them.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Perform log compaction, returning a handle to the generated snapshot.
    ///
    /// The snapshot captures the state machine as of its last applied log, along with the latest
    /// membership configuration covered by it. Once the snapshot is durable, log entries more
    /// than `trailing` entries behind the snapshot's last index are discarded; the trailing
    /// window is retained so that slightly-lagging followers can still catch up from the log.
    async fn do_log_compaction(&self, trailing: u64) -> Result<Snapshot<Self::SnapshotData>>;

    /// Create a new blank snapshot, returning a writable handle to the snapshot object.
    ///
    /// Raft will use this handle to receive snapshot data from the leader.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot which has been received from the cluster leader.
    ///
    /// Persist the snapshot, discard the entire log, restore the state machine from the snapshot
    /// payload, and re-base the log so that the next appended entry lands at
    /// `meta.last_log_id.index + 1`. All previous snapshots beyond the retention window should
    /// be deleted at this point.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()>;

    /// Get a readable handle to the current snapshot, along with its metadata.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> SM;

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
