//! An in-memory storage system implementing the `keel_raft::RaftStorage` trait. Please ⭐ on
//! github!

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::Bound;
use std::ops::RangeBounds;

use anyhow::anyhow;
use anyhow::Result;
use keel_raft::async_trait::async_trait;
use keel_raft::raft::Entry;
use keel_raft::raft::EntryPayload;
use keel_raft::storage::CompactedRange;
use keel_raft::storage::HardState;
use keel_raft::storage::InitialState;
use keel_raft::storage::RaftStorage;
use keel_raft::storage::Snapshot;
use keel_raft::AppData;
use keel_raft::AppDataResponse;
use keel_raft::LogId;
use keel_raft::Membership;
use keel_raft::NodeId;
use keel_raft::RaftStorageDebug;
use keel_raft::SnapshotMeta;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::sync::RwLockWriteGuard;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should
    /// probably be an enum representing all of the various types of requests / operations which
    /// a client can perform.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` works with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// Error used to trigger Raft shutdown from storage.
#[derive(Clone, Debug, Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// The application snapshot type which the `MemStore` works with.
#[derive(Clone, Debug)]
pub struct MemStoreSnapshot {
    /// The snapshot metadata.
    pub meta: SnapshotMeta,
    /// The data of the state machine at the time of this snapshot.
    pub data: Vec<u8>,
}

/// The state machine of the `MemStore`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,
    /// A mapping of client IDs to their state info.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// An in-memory storage system implementing the `keel_raft::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this memory storage instances is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The highest log index removed by log compaction; 0 when nothing was compacted yet.
    last_purged: RwLock<u64>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(MemStoreStateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);

        Self {
            id,
            log,
            sm,
            hs,
            last_purged: RwLock::new(0),
            current_snapshot,
        }
    }

    /// The ID of the Raft node which this storage instance belongs to.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.write().await
    }

    /// Find the latest membership config appended at or below the given index, along with the
    /// index it was appended at.
    async fn membership_at(&self, upto: Option<u64>) -> (Membership, u64) {
        {
            let log = self.log.read().await;
            let found = log
                .values()
                .rev()
                .filter(|entry| upto.map(|upto| entry.log_id.index <= upto).unwrap_or(true))
                .find_map(|entry| match &entry.payload {
                    EntryPayload::ConfigChange(cfg) => Some((cfg.membership.clone(), entry.log_id.index)),
                    _ => None,
                });
            if let Some(found) = found {
                return found;
            }
        }
        let snapshot = self.current_snapshot.read().await;
        match &*snapshot {
            Some(snapshot) => (snapshot.meta.membership.clone(), snapshot.meta.membership_index),
            None => (Membership::default(), 0),
        }
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership(&self) -> Result<(Membership, u64)> {
        Ok(self.membership_at(None).await)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let hs = self.hs.read().await.clone();
        let hard_state = match hs {
            Some(hard_state) => hard_state,
            None => return Ok(InitialState::new_initial()),
        };

        let last_log_id = {
            let log = self.log.read().await;
            match log.values().next_back() {
                Some(entry) => entry.log_id,
                None => {
                    let snapshot = self.current_snapshot.read().await;
                    snapshot.as_ref().map(|s| s.meta.last_log_id).unwrap_or_default()
                }
            }
        };
        let last_applied_log = self.sm.read().await.last_applied_log;
        let (membership, membership_index) = self.membership_at(None).await;

        Ok(InitialState {
            last_log_id,
            last_applied_log,
            hard_state,
            membership,
            membership_index,
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn bootstrap(&self, membership: Membership) -> Result<()> {
        let mut hs = self.hs.write().await;
        let mut log = self.log.write().await;
        if hs.is_some() || !log.is_empty() {
            return Err(anyhow!("store already holds state, refusing to bootstrap"));
        }

        *hs = Some(HardState {
            current_term: 1,
            voted_for: None,
        });
        log.insert(1, Entry {
            log_id: LogId::new(1, 1),
            payload: EntryPayload::ConfigChange(keel_raft::raft::EntryConfigChange { membership }),
        });
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn recover(&self, membership: Membership) -> Result<()> {
        let hs = self.hs.read().await.clone();
        let term = hs.map(|hs| hs.current_term).unwrap_or(1);
        let mut log = self.log.write().await;
        let index = log.values().next_back().map(|entry| entry.log_id.index).unwrap_or(0) + 1;
        log.insert(index, Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::ConfigChange(keel_raft::raft::EntryConfigChange { membership }),
        });
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let last_purged = *self.last_purged.read().await;
        let touches_compacted = match range.start_bound() {
            Bound::Included(start) => *start <= last_purged,
            Bound::Excluded(start) => *start < last_purged,
            Bound::Unbounded => false,
        };
        if touches_compacted && last_purged > 0 {
            return Err(CompactedRange { upto: last_purged }.into());
        }
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, val)| val.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from(&self, start: u64) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&start);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(norm) => {
                    let data = &norm.data;
                    if let Some((serial, r)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(r.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    res.push(ClientResponse(previous));
                }
                EntryPayload::Barrier | EntryPayload::ConfigChange(_) => {
                    res.push(ClientResponse(None));
                }
            }
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self, trailing: u64) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log) = {
            let sm = self.sm.read().await;
            (serde_json::to_vec(&*sm)?, sm.last_applied_log)
        };
        if last_applied_log.index == 0 {
            return Err(anyhow!("nothing applied yet, refusing to snapshot"));
        }
        let (membership, membership_index) = self.membership_at(Some(last_applied_log.index)).await;

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            membership,
            membership_index,
        };

        // Truncate the log prefix behind the trailing window.
        {
            let mut log = self.log.write().await;
            let mut last_purged = self.last_purged.write().await;
            let bound = last_applied_log.index.saturating_sub(trailing);
            let retained = log.split_off(&(bound + 1));
            *log = retained;
            if bound > *last_purged {
                *last_purged = bound;
            }
        }

        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(MemStoreSnapshot {
                meta: meta.clone(),
                data: data.clone(),
            });
        }

        tracing::trace!({snapshot=%meta.last_log_id}, "log compaction complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        let data = snapshot.into_inner();
        let mut new_sm: MemStoreStateMachine = serde_json::from_slice(&data)?;
        new_sm.last_applied_log = meta.last_log_id;

        {
            let mut sm = self.sm.write().await;
            *sm = new_sm;
        }
        // The snapshot replaces the entire log; the next append lands just past it.
        {
            let mut log = self.log.write().await;
            let mut last_purged = self.last_purged.write().await;
            log.clear();
            *last_purged = meta.last_log_id.index;
        }
        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(MemStoreSnapshot {
                meta: meta.clone(),
                data,
            });
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_raft::raft::EntryNormal;
    use keel_raft::Role;
    use keel_raft::Server;

    fn membership_of_three() -> Membership {
        Membership::new(vec![
            Server::new(1, "addr1", Role::Voter),
            Server::new(2, "addr2", Role::Voter),
            Server::new(3, "addr3", Role::Voter),
        ])
    }

    fn command(index: u64, term: u64, client: &str, serial: u64) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(EntryNormal {
                data: ClientRequest {
                    client: client.into(),
                    serial,
                    status: format!("status-{}", serial),
                },
            }),
        }
    }

    #[tokio::test]
    async fn bootstrap_writes_term_one_and_config_entry() -> Result<()> {
        let store = MemStore::new(1);
        store.bootstrap(membership_of_three()).await?;

        let state = store.get_initial_state().await?;
        assert_eq!(state.hard_state.current_term, 1);
        assert_eq!(state.hard_state.voted_for, None);
        assert_eq!(state.last_log_id, LogId::new(1, 1));
        assert_eq!(state.membership, membership_of_three());
        assert_eq!(state.membership_index, 1);

        // Bootstrapping twice must fail.
        assert!(store.bootstrap(membership_of_three()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn apply_deduplicates_by_client_serial() -> Result<()> {
        let store = MemStore::new(1);
        let first = command(1, 1, "c0", 7);
        let res = store.apply_to_state_machine(&[&first]).await?;
        assert_eq!(res[0].0, None);

        // Same serial: the recorded response is returned, state does not change.
        let replay = command(2, 1, "c0", 7);
        let res = store.apply_to_state_machine(&[&replay]).await?;
        assert_eq!(res[0].0, None);
        let sm = store.get_state_machine().await;
        assert_eq!(sm.client_status.get("c0"), Some(&"status-7".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn compaction_retains_trailing_window_and_flags_compacted_reads() -> Result<()> {
        let store = MemStore::new(1);
        let entries: Vec<_> = (1..=10).map(|i| command(i, 1, "c0", i)).collect();
        let entry_refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&entry_refs).await?;
        store.apply_to_state_machine(&entry_refs).await?;

        let snapshot = store.do_log_compaction(3).await?;
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 10));

        // Entries 1..=7 are purged; 8..=10 retained for followers.
        assert!(store.try_get_log_entry(7).await?.is_none());
        assert!(store.try_get_log_entry(8).await?.is_some());

        let err = store.get_log_entries(5..10).await.unwrap_err();
        assert!(err.downcast_ref::<CompactedRange>().is_some());
        assert!(store.get_log_entries(8..11).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn truncate_past_end_is_a_no_op() -> Result<()> {
        let store = MemStore::new(1);
        let entries: Vec<_> = (1..=3).map(|i| command(i, 1, "c0", i)).collect();
        let entry_refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&entry_refs).await?;

        store.delete_logs_from(10).await?;
        assert_eq!(store.get_log_entries(1..4).await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_install_round_trips_state_and_meta() -> Result<()> {
        let source = MemStore::new(1);
        let entries: Vec<_> = (1..=5).map(|i| command(i, 2, "c0", i)).collect();
        let entry_refs: Vec<_> = entries.iter().collect();
        source.append_to_log(&entry_refs).await?;
        source.apply_to_state_machine(&entry_refs).await?;
        let snapshot = source.do_log_compaction(1).await?;
        let data = snapshot.snapshot.get_ref().clone();

        let target = MemStore::new(2);
        let mut receiving = target.begin_receiving_snapshot().await?;
        receiving.get_mut().extend_from_slice(&data);
        target.finalize_snapshot_installation(&snapshot.meta, receiving).await?;

        let installed = target.get_current_snapshot().await?.unwrap();
        assert_eq!(installed.meta, snapshot.meta);
        let sm = target.get_state_machine().await;
        assert_eq!(sm.last_applied_log, LogId::new(2, 5));
        assert_eq!(sm.client_status.get("c0"), Some(&"status-5".to_string()));
        Ok(())
    }
}
