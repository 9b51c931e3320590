use std::collections::BTreeMap;

use anyhow::Result;
use diskstore::DiskStore;
use diskstore::StateMachine;
use diskstore::StoreError;
use diskstore::StoreOptions;
use keel_raft::async_trait::async_trait;
use keel_raft::raft::Entry;
use keel_raft::raft::EntryNormal;
use keel_raft::raft::EntryPayload;
use keel_raft::storage::CompactedRange;
use keel_raft::storage::HardState;
use keel_raft::storage::RaftStorage;
use keel_raft::LogId;
use keel_raft::Membership;
use keel_raft::Role;
use keel_raft::Server;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

/// A tiny key/value command for exercising the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct SetCmd {
    key: String,
    value: String,
}

impl keel_raft::AppData for SetCmd {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SetResponse(Option<String>);

impl keel_raft::AppDataResponse for SetResponse {}

/// An in-memory key/value state machine behind the disk store.
#[derive(Default)]
struct KvFsm {
    state: Mutex<KvState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct KvState {
    last_applied: LogId,
    data: BTreeMap<String, String>,
}

#[async_trait]
impl StateMachine<SetCmd, SetResponse> for KvFsm {
    async fn apply(&self, entries: &[&Entry<SetCmd>]) -> Result<Vec<SetResponse>> {
        let mut state = self.state.lock().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            state.last_applied = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(cmd) => {
                    let prev = state.data.insert(cmd.data.key.clone(), cmd.data.value.clone());
                    res.push(SetResponse(prev));
                }
                _ => res.push(SetResponse(None)),
            }
        }
        Ok(res)
    }

    async fn snapshot(&self) -> Result<(Vec<u8>, LogId)> {
        let state = self.state.lock().await;
        Ok((serde_json::to_vec(&*state)?, state.last_applied))
    }

    async fn restore(&self, data: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = serde_json::from_slice(&data)?;
        Ok(())
    }

    async fn last_applied(&self) -> Result<LogId> {
        Ok(self.state.lock().await.last_applied)
    }
}

/// The concrete store type under test.
type KvStore = DiskStore<SetCmd, SetResponse, KvFsm>;

fn membership() -> Membership {
    Membership::new(vec![
        Server::new(1, "node-1", Role::Voter),
        Server::new(2, "node-2", Role::Voter),
        Server::new(3, "node-3", Role::Voter),
    ])
}

fn command(term: u64, index: u64) -> Entry<SetCmd> {
    Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal {
            data: SetCmd {
                key: format!("key-{}", index),
                value: format!("value-{}", index),
            },
        }),
    }
}

/// Small segments so that a handful of entries rolls through several files.
fn small_segments() -> StoreOptions {
    StoreOptions { segment_size: 1024 }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_append_and_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
        store.bootstrap(membership()).await?;

        let entries: Vec<_> = (2..=40).map(|i| command(1, i)).collect();
        let refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&refs).await?;

        store
            .save_hard_state(&HardState {
                current_term: 3,
                voted_for: Some(2),
            })
            .await?;
        store.close().await?;
    }

    // Reopen: hard state, log and membership all survive the restart.
    let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
    let state = store.get_initial_state().await?;
    assert_eq!(state.hard_state.current_term, 3);
    assert_eq!(state.hard_state.voted_for, Some(2));
    assert_eq!(state.last_log_id, LogId::new(1, 40));
    assert_eq!(state.membership, membership());
    assert_eq!(state.membership_index, 1);

    let entries = store.get_log_entries(2..=40).await?;
    assert_eq!(entries.len(), 39);
    assert_eq!(entries[0].log_id, LogId::new(1, 2));
    assert_eq!(entries.last().unwrap().log_id, LogId::new(1, 40));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_lock_is_exclusive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let _store = KvStore::open(dir.path(), KvFsm::default()).await?;

    let second = KvStore::open(dir.path(), KvFsm::default()).await;
    assert!(matches!(second, Err(StoreError::Locked(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_suffix_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
        store.bootstrap(membership()).await?;
        let entries: Vec<_> = (2..=30).map(|i| command(1, i)).collect();
        let refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&refs).await?;

        store.delete_logs_from(20).await?;
        assert_eq!(store.try_get_log_entry(19).await?.map(|e| e.log_id), Some(LogId::new(1, 19)));
        assert!(store.try_get_log_entry(20).await?.is_none());

        // Truncating past the end is a no-op.
        store.delete_logs_from(100).await?;
        assert_eq!(store.try_get_log_entry(19).await?.map(|e| e.log_id), Some(LogId::new(1, 19)));

        // Appending after a truncation reuses the freed indexes at a new term.
        let replacement = command(2, 20);
        store.append_to_log(&[&replacement]).await?;
        store.close().await?;
    }

    let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
    let state = store.get_initial_state().await?;
    assert_eq!(state.last_log_id, LogId::new(2, 20));
    assert_eq!(store.try_get_log_entry(20).await?.map(|e| e.log_id), Some(LogId::new(2, 20)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compaction_truncates_prefix_and_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
        store.bootstrap(membership()).await?;
        let entries: Vec<_> = (2..=50).map(|i| command(1, i)).collect();
        let refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&refs).await?;
        store.apply_to_state_machine(&refs).await?;

        let snapshot = store.do_log_compaction(10).await?;
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 50));
        assert_eq!(snapshot.meta.membership, membership());

        // Entries within the trailing window survive; older reads are flagged compacted.
        assert!(store.try_get_log_entry(41).await?.is_some());
        assert!(store.try_get_log_entry(40).await?.is_none());
        let err = store.get_log_entries(30..45).await.unwrap_err();
        assert!(err.downcast_ref::<CompactedRange>().is_some());
        store.close().await?;
    }

    let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
    let current = store.get_current_snapshot().await?.expect("snapshot must survive restart");
    assert_eq!(current.meta.last_log_id, LogId::new(1, 50));

    let mut payload = Vec::new();
    let mut handle = current.snapshot;
    handle.read_to_end(&mut payload).await?;
    let state: KvState = serde_json::from_slice(&payload)?;
    assert_eq!(state.data.get("key-50"), Some(&"value-50".to_string()));

    let state = store.get_initial_state().await?;
    assert_eq!(state.last_log_id, LogId::new(1, 50));
    // The state machine was brought forward to the snapshot at open.
    assert_eq!(state.last_applied_log, LogId::new(1, 50));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_install_rebases_the_log() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let store = KvStore::open_with_options(dir.path(), KvFsm::default(), small_segments()).await?;
    store.bootstrap(membership()).await?;
    let entries: Vec<_> = (2..=10).map(|i| command(1, i)).collect();
    let refs: Vec<_> = entries.iter().collect();
    store.append_to_log(&refs).await?;

    // An incoming snapshot well past the local log.
    let mut incoming = KvState::default();
    incoming.last_applied = LogId::new(2, 100);
    incoming.data.insert("key-100".into(), "value-100".into());
    let payload = serde_json::to_vec(&incoming)?;

    let meta = keel_raft::SnapshotMeta {
        last_log_id: LogId::new(2, 100),
        membership: membership(),
        membership_index: 1,
    };
    let mut receiving = store.begin_receiving_snapshot().await?;
    tokio::io::AsyncWriteExt::write_all(&mut *receiving, &payload).await?;
    tokio::io::AsyncWriteExt::shutdown(&mut *receiving).await?;
    store.finalize_snapshot_installation(&meta, receiving).await?;

    // The old log is gone; the next append lands just past the snapshot.
    assert!(store.try_get_log_entry(5).await?.is_none());
    let state = store.get_initial_state().await?;
    assert_eq!(state.last_log_id, LogId::new(2, 100));
    assert_eq!(state.last_applied_log, LogId::new(2, 100));

    let next = command(2, 101);
    store.append_to_log(&[&next]).await?;
    assert_eq!(store.get_log_entries(101..102).await?.len(), 1);
    store.close().await?;
    Ok(())
}
