//! A file-backed implementation of the `keel_raft::RaftStorage` trait.
//!
//! The store owns a directory and keeps the Raft log in segment files, the term/vote/start
//! index in an alternating pair of metadata records, and snapshots in metadata + data file
//! pairs — the layout is a compatibility contract, see the individual modules. The application
//! state machine is supplied behind the [`StateMachine`] trait; the store feeds it committed
//! entries and captures / restores its snapshots.
//!
//! The whole log is mirrored in memory: disk I/O exists for durability, reads are served from
//! the mirror. One store instance owns its directory exclusively, enforced with a lock file.

mod codec;
mod error;
mod meta;
mod prepare;
mod segment;
mod snapshot;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bytes::BufMut;

use anyhow::anyhow;
use anyhow::Result;
use keel_raft::async_trait::async_trait;
use keel_raft::raft::Entry;
use keel_raft::raft::EntryConfigChange;
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
use keel_raft::SnapshotMeta;
use thiserror::Error;
use tokio::sync::Mutex;

pub use crate::error::StoreError;

use crate::meta::MetaRecord;
use crate::prepare::Preparer;
use crate::snapshot::SnapshotInfo;

/// The application state machine which the disk store drives.
///
/// Committed entries are handed to `apply` in strict log order. `snapshot` captures the full
/// state as an opaque payload together with the log id it covers; `restore` replaces the state
/// from such a payload.
#[async_trait]
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Apply a batch of committed entries, in order, returning one response per entry.
    ///
    /// Barrier and configuration entries are delivered too so that the applied index stays
    /// dense; return a default response for them.
    async fn apply(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Capture the complete state as an opaque payload, together with the log id it covers.
    ///
    /// The pair must be consistent: the payload reflects exactly the entries applied up to the
    /// returned log id.
    async fn snapshot(&self) -> Result<(Vec<u8>, LogId)>;

    /// Replace the complete state from a payload produced by `snapshot`.
    async fn restore(&self, data: Vec<u8>) -> Result<()>;

    /// The log id of the last entry applied.
    async fn last_applied(&self) -> Result<LogId>;
}

/// Error used to trigger Raft shutdown from storage.
#[derive(Clone, Debug, Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// Tunables of the disk store.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// The pre-allocated size of open segment files.
    pub segment_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            segment_size: 256 * 1024,
        }
    }
}

/// A closed segment on disk, covering the inclusive range `[first, last]`.
#[derive(Clone, Copy, Debug)]
struct ClosedSegment {
    first: u64,
    last: u64,
}

/// The open segment currently receiving appends.
struct OpenSegment {
    path: PathBuf,
    file: fs::File,
    /// First entry index written into this segment; 0 while the segment is still empty.
    first_index: u64,
    last_index: u64,
    /// Byte offset at which the next batch will be written.
    offset: u64,
}

struct Inner<D: AppData> {
    /// The current metadata record; `has_meta` is false while nothing was ever stored.
    meta: MetaRecord,
    has_meta: bool,
    /// In-memory mirror of the log.
    log: BTreeMap<u64, Entry<D>>,
    closed: Vec<ClosedSegment>,
    open: Option<OpenSegment>,
    current_snapshot: Option<(SnapshotMeta, PathBuf)>,
    /// The temp file of a snapshot currently being received from the leader.
    pending_install: Option<PathBuf>,
    install_counter: u64,
    last_snapshot_timestamp: u64,
}

/// A file-backed `RaftStorage` implementation.
pub struct DiskStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    dir: PathBuf,
    options: StoreOptions,
    fsm: M,
    preparer: Preparer,
    inner: Mutex<Inner<D>>,
    /// The lock file; holding it holds the directory lock for the store's lifetime.
    _lock: fs::File,
    marker: PhantomData<fn() -> R>,
}

impl<D, R, M> DiskStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    /// Open (or create) a store in the given directory with default options.
    pub async fn open(dir: impl Into<PathBuf>, fsm: M) -> Result<Self, StoreError> {
        Self::open_with_options(dir, fsm, StoreOptions::default()).await
    }

    /// Open (or create) a store in the given directory.
    ///
    /// Fails with [`StoreError::Locked`] when another instance owns the directory, and with
    /// `Malformed`/`Corrupt` when the on-disk data does not pass validation — the store never
    /// starts on bad data.
    pub async fn open_with_options(
        dir: impl Into<PathBuf>,
        fsm: M,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = lock_dir(&dir)?;

        let meta_record = meta::load(&dir)?;
        let has_meta = meta_record.is_some();
        let meta_record = meta_record.unwrap_or(MetaRecord {
            version: 0,
            term: 0,
            voted_for: 0,
            start_index: 1,
        });

        // Snapshots: the latest one is the current snapshot.
        let snapshots = snapshot::scan(&dir)?;
        let current_snapshot = match snapshots.last() {
            Some(info) => {
                let meta = snapshot::load_meta(&dir, info)?;
                Some((meta, info.data_path(&dir)))
            }
            None => None,
        };

        // Restarted state machines come back empty; bring the application state forward to the
        // snapshot before the engine starts, so that replay resumes from the trailing log.
        if let Some((snapshot_meta, data_path)) = &current_snapshot {
            let snapshot_covers = snapshot_meta.last_log_id;
            if fsm.last_applied().await.map_err(|err| StoreError::Corrupt(err.to_string()))? < snapshot_covers {
                let data = fs::read(data_path)?;
                fsm.restore(data).await.map_err(|err| StoreError::Corrupt(err.to_string()))?;
            }
        }

        let (log, closed, max_open_counter) = load_segments::<D>(&dir, meta_record.start_index)?;

        // The log must be dense starting at the metadata's start index.
        let mut expected = meta_record.start_index;
        for index in log.keys() {
            if *index != expected {
                return Err(StoreError::Corrupt(format!(
                    "log has a hole: expected index {}, found {}",
                    expected, index
                )));
            }
            expected += 1;
        }

        let preparer = Preparer::spawn(dir.clone(), options.segment_size, max_open_counter + 1);

        Ok(Self {
            dir,
            options,
            fsm,
            preparer,
            inner: Mutex::new(Inner {
                meta: meta_record,
                has_meta,
                log,
                closed,
                open: None,
                current_snapshot,
                pending_install: None,
                install_counter: 0,
                last_snapshot_timestamp: 0,
            }),
            _lock: lock,
            marker: PhantomData,
        })
    }

    /// A handle to the application state machine.
    pub fn state_machine(&self) -> &M {
        &self.fsm
    }

    /// Shut the store down: stop the segment preparer and seal the open segment.
    ///
    /// The directory lock is released when the store is dropped.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.preparer.close().await;
        let mut inner = self.inner.lock().await;
        self.seal_open(&mut inner)?;
        Ok(())
    }

    /// Durably append a batch of entries, rolling to a fresh segment when the current one is
    /// full.
    async fn write_entries(&self, inner: &mut Inner<D>, entries: &[&Entry<D>]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let buf = segment::encode_batch(entries)?;

        let needs_roll = match &inner.open {
            // A non-empty open segment rolls when the batch does not fit; an empty one takes
            // the batch regardless (the file simply grows past its pre-allocation).
            Some(open) => open.first_index != 0 && open.offset + buf.len() as u64 > self.options.segment_size,
            None => true,
        };
        if needs_roll {
            self.seal_open(inner)?;
            let prepared = self.preparer.acquire().await?;
            inner.open = Some(OpenSegment {
                path: prepared.path,
                file: prepared.file,
                first_index: 0,
                last_index: 0,
                offset: segment::SEGMENT_HEADER_SIZE,
            });
        }

        let open = inner.open.as_mut().expect("open segment present after roll");
        let file = open.file.try_clone()?;
        let offset = open.offset;
        let len = buf.len() as u64;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            file.write_all_at(&buf, offset)?;
            file.sync_data()?;
            Ok(())
        })
        .await
        .map_err(|_| StoreError::Canceled)??;

        open.offset += len;
        if open.first_index == 0 {
            open.first_index = entries[0].log_id.index;
        }
        open.last_index = entries[entries.len() - 1].log_id.index;
        for entry in entries {
            inner.log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    /// Seal the open segment: truncate it to its used length and rename it to its closed form.
    /// An empty open segment is simply removed.
    fn seal_open(&self, inner: &mut Inner<D>) -> Result<(), StoreError> {
        let open = match inner.open.take() {
            Some(open) => open,
            None => return Ok(()),
        };
        if open.first_index == 0 {
            drop(open.file);
            fs::remove_file(&open.path)?;
            return Ok(());
        }
        open.file.set_len(open.offset)?;
        open.file.sync_all()?;
        let name = segment::closed_name(open.first_index, open.last_index);
        fs::rename(&open.path, self.dir.join(&name))?;
        snapshot::sync_dir(&self.dir)?;
        inner.closed.push(ClosedSegment {
            first: open.first_index,
            last: open.last_index,
        });
        Ok(())
    }

    /// Write the given entries as a closed segment file.
    fn write_closed_segment(&self, entries: &[&Entry<D>]) -> Result<ClosedSegment, StoreError> {
        let first = entries[0].log_id.index;
        let last = entries[entries.len() - 1].log_id.index;
        let name = segment::closed_name(first, last);
        let path = self.dir.join(&name);

        let mut data = Vec::new();
        data.put_u64_le(segment::SEGMENT_FORMAT);
        data.extend_from_slice(&segment::encode_batch(entries)?);

        let mut file = fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(ClosedSegment { first, last })
    }

    /// A monotonic timestamp for snapshot filenames.
    fn next_snapshot_timestamp(inner: &mut Inner<D>) -> u64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        let ts = now.max(inner.last_snapshot_timestamp + 1);
        inner.last_snapshot_timestamp = ts;
        ts
    }

    fn membership_in(&self, inner: &Inner<D>, upto: Option<u64>) -> (Membership, u64) {
        for entry in inner.log.values().rev() {
            if let Some(upto) = upto {
                if entry.log_id.index > upto {
                    continue;
                }
            }
            if let EntryPayload::ConfigChange(cfg) = &entry.payload {
                return (cfg.membership.clone(), entry.log_id.index);
            }
        }
        match &inner.current_snapshot {
            Some((meta, _)) => (meta.membership.clone(), meta.membership_index),
            None => (Membership::default(), 0),
        }
    }

    /// Persist a new metadata record derived from the current one.
    fn store_meta(&self, inner: &mut Inner<D>, term: u64, voted_for: u64, start_index: u64) -> Result<(), StoreError> {
        let record = MetaRecord {
            version: inner.meta.version + 1,
            term,
            voted_for,
            start_index,
        };
        meta::store(&self.dir, &record)?;
        inner.meta = record;
        inner.has_meta = true;
        Ok(())
    }
}

/// Acquire the exclusive directory lock.
fn lock_dir(dir: &Path) -> Result<fs::File, StoreError> {
    let path = dir.join("LOCK");
    let file = fs::OpenOptions::new().create(true).write(true).open(&path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(StoreError::Locked(dir.display().to_string()));
    }
    Ok(file)
}

/// Load all segment files, absorbing open segments into closed form.
///
/// Entries below `start_index` belong to segments which predate the last compaction and are
/// skipped. Open segments may carry a torn batch at their tail from a crash mid-append; the
/// valid prefix is kept and re-written as a closed segment.
#[allow(clippy::type_complexity)]
fn load_segments<D: AppData>(
    dir: &Path,
    start_index: u64,
) -> Result<(BTreeMap<u64, Entry<D>>, Vec<ClosedSegment>, u64), StoreError> {
    let mut log = BTreeMap::new();
    let mut closed = Vec::new();
    let mut opens = Vec::new();
    let mut max_open_counter = 0;

    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = match name.to_str() {
            Some(name) => name.to_string(),
            None => continue,
        };
        if let Some((first, last)) = segment::parse_closed_name(&name) {
            let data = fs::read(dir.join(&name))?;
            let entries: Vec<Entry<D>> = segment::decode_segment(&data, false)?;
            for entry in entries {
                if entry.log_id.index >= start_index {
                    log.insert(entry.log_id.index, entry);
                }
            }
            closed.push(ClosedSegment { first, last });
        } else if let Some(counter) = segment::parse_open_name(&name) {
            max_open_counter = max_open_counter.max(counter);
            opens.push(name);
        }
    }

    // Absorb open segments: non-empty ones become closed segments, empty ones are leftovers of
    // the preparation pool and are removed.
    for name in opens {
        let path = dir.join(&name);
        let data = fs::read(&path)?;
        let entries: Vec<Entry<D>> = segment::decode_segment(&data, true)?;
        if entries.is_empty() {
            fs::remove_file(&path)?;
            continue;
        }
        let first = entries[0].log_id.index;
        let last = entries[entries.len() - 1].log_id.index;

        let mut sealed = Vec::new();
        sealed.put_u64_le(segment::SEGMENT_FORMAT);
        let refs: Vec<&Entry<D>> = entries.iter().collect();
        sealed.extend_from_slice(&segment::encode_batch(&refs)?);
        let closed_path = dir.join(segment::closed_name(first, last));
        fs::write(&closed_path, &sealed)?;
        fs::File::open(&closed_path)?.sync_all()?;
        fs::remove_file(&path)?;

        for entry in entries {
            if entry.log_id.index >= start_index {
                log.insert(entry.log_id.index, entry);
            }
        }
        closed.push(ClosedSegment { first, last });
    }
    snapshot::sync_dir(dir)?;

    closed.sort_by_key(|segment| segment.first);
    Ok((log, closed, max_open_counter))
}

#[async_trait]
impl<D, R, M> RaftStorage<D, R> for DiskStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    type SnapshotData = tokio::fs::File;
    type ShutdownError = ShutdownError;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership(&self) -> Result<(Membership, u64)> {
        let inner = self.inner.lock().await;
        Ok(self.membership_in(&inner, None))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let inner = self.inner.lock().await;
        if !inner.has_meta {
            return Ok(InitialState::new_initial());
        }

        let hard_state = HardState {
            current_term: inner.meta.term,
            voted_for: if inner.meta.voted_for == 0 {
                None
            } else {
                Some(inner.meta.voted_for)
            },
        };
        let last_log_id = match inner.log.values().next_back() {
            Some(entry) => entry.log_id,
            None => inner.current_snapshot.as_ref().map(|(meta, _)| meta.last_log_id).unwrap_or_default(),
        };
        let (membership, membership_index) = self.membership_in(&inner, None);
        let last_applied_log = self.fsm.last_applied().await?;

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
        let mut inner = self.inner.lock().await;
        if inner.has_meta || !inner.log.is_empty() {
            return Err(anyhow!("store already holds state, refusing to bootstrap"));
        }
        self.store_meta(&mut inner, 1, 0, 1)?;
        let entry = Entry {
            log_id: LogId::new(1, 1),
            payload: EntryPayload::ConfigChange(EntryConfigChange { membership }),
        };
        self.write_entries(&mut inner, &[&entry]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn recover(&self, membership: Membership) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let term = inner.meta.term.max(1);
        let index = inner
            .log
            .values()
            .next_back()
            .map(|entry| entry.log_id.index)
            .or_else(|| inner.current_snapshot.as_ref().map(|(meta, _)| meta.last_log_id.index))
            .unwrap_or(0)
            + 1;
        let entry = Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::ConfigChange(EntryConfigChange { membership }),
        };
        self.write_entries(&mut inner, &[&entry]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let start_index = inner.meta.start_index;
        self.store_meta(&mut inner, hs.current_term, hs.voted_for.unwrap_or(0), start_index)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>> {
        let inner = self.inner.lock().await;
        let start_index = inner.meta.start_index;
        let touches_compacted = match range.start_bound() {
            Bound::Included(start) => *start < start_index,
            Bound::Excluded(start) => *start + 1 < start_index,
            Bound::Unbounded => false,
        };
        if touches_compacted && start_index > 1 {
            return Err(CompactedRange { upto: start_index - 1 }.into());
        }
        Ok(inner.log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>> {
        let inner = self.inner.lock().await;
        Ok(inner.log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from(&self, start: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let last = match inner.log.keys().next_back() {
            Some(last) => *last,
            None => return Ok(()),
        };
        if start > last {
            return Ok(());
        }
        inner.log.split_off(&start);

        // Disk reconciliation. The open segment never survives a truncation: its surviving
        // prefix (if any) is rewritten as a closed segment, and the next append starts fresh.
        if let Some(open) = inner.open.take() {
            if open.first_index != 0 && open.first_index < start {
                let survivors: Vec<&Entry<D>> =
                    inner.log.range(open.first_index..start).map(|(_, entry)| entry).collect();
                if !survivors.is_empty() {
                    let sealed = self.write_closed_segment(&survivors)?;
                    inner.closed.push(sealed);
                }
            }
            drop(open.file);
            fs::remove_file(&open.path)?;
        }

        // Closed segments fully above the cut are removed; the one containing the cut is
        // rewritten to its surviving prefix.
        let mut retained = Vec::new();
        for segment in std::mem::take(&mut inner.closed) {
            if segment.first >= start {
                fs::remove_file(self.dir.join(segment::closed_name(segment.first, segment.last)))?;
            } else if segment.last >= start {
                let survivors: Vec<&Entry<D>> =
                    inner.log.range(segment.first..start).map(|(_, entry)| entry).collect();
                if !survivors.is_empty() {
                    let sealed = self.write_closed_segment(&survivors)?;
                    retained.push(sealed);
                }
                fs::remove_file(self.dir.join(segment::closed_name(segment.first, segment.last)))?;
            } else {
                retained.push(segment);
            }
        }
        retained.sort_by_key(|segment| segment.first);
        inner.closed = retained;
        snapshot::sync_dir(&self.dir)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.write_entries(&mut inner, entries).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>> {
        self.fsm.apply(entries).await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self, trailing: u64) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied) = self.fsm.snapshot().await?;
        if last_applied.index == 0 {
            return Err(anyhow!("nothing applied yet, refusing to snapshot"));
        }

        let mut inner = self.inner.lock().await;
        let (membership, membership_index) = self.membership_in(&inner, Some(last_applied.index));
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            membership,
            membership_index,
        };

        let timestamp = Self::next_snapshot_timestamp(&mut inner);
        let dir = self.dir.clone();
        let put_meta = meta.clone();
        let info = tokio::task::spawn_blocking(move || -> Result<SnapshotInfo, StoreError> {
            let info = snapshot::put(&dir, &put_meta, &data, timestamp)?;
            let infos = snapshot::scan(&dir)?;
            snapshot::keep_last_two(&dir, &infos)?;
            Ok(info)
        })
        .await
        .map_err(|_| StoreError::Canceled)??;

        // Truncate the log prefix behind the trailing window: first make the new start index
        // durable, then drop the entries and the segment files below it. A crash in between
        // only leaves unreferenced files behind.
        let bound = last_applied.index.saturating_sub(trailing);
        if bound >= inner.meta.start_index {
            let (term, voted_for) = (inner.meta.term, inner.meta.voted_for);
            self.store_meta(&mut inner, term, voted_for, bound + 1)?;

            let retained_entries = inner.log.split_off(&(bound + 1));
            inner.log = retained_entries;

            let mut retained = Vec::new();
            for segment in std::mem::take(&mut inner.closed) {
                if segment.last <= bound {
                    fs::remove_file(self.dir.join(segment::closed_name(segment.first, segment.last)))?;
                } else {
                    retained.push(segment);
                }
            }
            inner.closed = retained;
            snapshot::sync_dir(&self.dir)?;
        }

        let data_path = info.data_path(&self.dir);
        inner.current_snapshot = Some((meta.clone(), data_path.clone()));

        let file = tokio::fs::File::open(&data_path).await?;
        tracing::debug!(snapshot=%meta.last_log_id, "log compaction complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        let mut inner = self.inner.lock().await;
        inner.install_counter += 1;
        let path = self.dir.join(format!("install-{}.tmp", inner.install_counter));
        let file = tokio::fs::File::create(&path).await?;
        inner.pending_install = Some(path);
        Ok(Box::new(file))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        snapshot.sync_all().await?;
        drop(snapshot);

        let mut inner = self.inner.lock().await;
        let tmp = inner.pending_install.take().ok_or_else(|| anyhow!("no snapshot is being received"))?;

        let timestamp = Self::next_snapshot_timestamp(&mut inner);
        let info = SnapshotInfo {
            term: meta.last_log_id.term,
            index: meta.last_log_id.index,
            timestamp,
        };
        let data_path = info.data_path(&self.dir);
        fs::rename(&tmp, &data_path)?;
        snapshot::write_meta(&self.dir, meta, timestamp)?;
        snapshot::sync_dir(&self.dir)?;

        // The snapshot replaces the log wholesale: drop every segment and re-base the next
        // append index just past the snapshot. The re-base is unconditional — the log may have
        // been truncated at any point before the install, and the snapshot is now the only
        // source of truth for where the log resumes.
        inner.log.clear();
        if let Some(open) = inner.open.take() {
            drop(open.file);
            fs::remove_file(&open.path)?;
        }
        for segment in std::mem::take(&mut inner.closed) {
            fs::remove_file(self.dir.join(segment::closed_name(segment.first, segment.last)))?;
        }
        let (term, voted_for) = (inner.meta.term, inner.meta.voted_for);
        self.store_meta(&mut inner, term, voted_for, meta.last_log_id.index + 1)?;
        snapshot::sync_dir(&self.dir)?;

        let infos = snapshot::scan(&self.dir)?;
        snapshot::keep_last_two(&self.dir, &infos)?;

        inner.current_snapshot = Some((meta.clone(), data_path.clone()));
        drop(inner);

        let data = fs::read(&data_path)?;
        self.fsm.restore(data).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        let inner = self.inner.lock().await;
        match &inner.current_snapshot {
            Some((meta, path)) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Some(Snapshot {
                    meta: meta.clone(),
                    snapshot: Box::new(file),
                }))
            }
            None => Ok(None),
        }
    }
}
