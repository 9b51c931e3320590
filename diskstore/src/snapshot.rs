//! Snapshot metadata and data files.
//!
//! A snapshot is a pair of files named `snapshot-<term>-<index>-<timestamp>` (the raw state
//! machine payload) and the same name suffixed `.meta` (format, checksum and the membership
//! configuration as of the snapshot). The two most recent snapshots are retained; a metadata
//! file without its data file is the leftover of an aborted snapshot and is removed on scan.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::Buf;
use bytes::BufMut;
use keel_raft::LogId;
use keel_raft::SnapshotMeta;

use crate::codec;
use crate::error::StoreError;

/// On-disk format identifier of the snapshot metadata file.
const SNAPSHOT_FORMAT: u64 = 1;
/// Arbitrary maximum configuration size. Should practically be enough.
const MAX_MEMBERSHIP_SIZE: u64 = 1024 * 1024;

/// A snapshot found on disk, identified by the fields of its filename.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SnapshotInfo {
    pub term: u64,
    pub index: u64,
    pub timestamp: u64,
}

impl SnapshotInfo {
    pub(crate) fn data_filename(&self) -> String {
        format!("snapshot-{}-{}-{}", self.term, self.index, self.timestamp)
    }

    pub(crate) fn meta_filename(&self) -> String {
        format!("{}.meta", self.data_filename())
    }

    pub(crate) fn data_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.data_filename())
    }
}

/// Parse a snapshot metadata filename.
pub(crate) fn parse_meta_filename(name: &str) -> Option<SnapshotInfo> {
    let stem = name.strip_suffix(".meta")?;
    let rest = stem.strip_prefix("snapshot-")?;
    let mut parts = rest.splitn(3, '-');
    let term = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let timestamp = parts.next()?.parse().ok()?;
    Some(SnapshotInfo { term, index, timestamp })
}

/// Scan the directory for snapshots, removing aborted leftovers.
///
/// The result is sorted by `(term, index, timestamp)`: the last element is the most recent
/// snapshot.
pub(crate) fn scan(dir: &Path) -> Result<Vec<SnapshotInfo>, StoreError> {
    let mut infos = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let info = match parse_meta_filename(name) {
            Some(info) => info,
            None => continue,
        };
        // A metadata file without its data file means the snapshot was aborted before
        // finishing; remove the leftover.
        if !info.data_path(dir).exists() {
            tracing::warn!(file=%name, "removing metadata of aborted snapshot");
            let _ = fs::remove_file(dir.join(name));
            continue;
        }
        infos.push(info);
    }
    infos.sort();
    Ok(infos)
}

/// Durably write the metadata and data files of a snapshot.
///
/// Layout of the metadata file: `format u64 | crc u64 | membership_index u64 |
/// membership_len u64 | membership bytes`, with the crc computed over the index, length and
/// membership bytes. The data file is written first so that a crash can only ever leave an
/// orphaned data file (harmless) rather than an orphaned metadata file pointing at nothing.
pub(crate) fn put(dir: &Path, meta: &SnapshotMeta, data: &[u8], timestamp: u64) -> Result<SnapshotInfo, StoreError> {
    let info = SnapshotInfo {
        term: meta.last_log_id.term,
        index: meta.last_log_id.index,
        timestamp,
    };
    write_file(dir, &info.data_filename(), &[data])?;
    write_meta(dir, meta, timestamp)?;
    sync_dir(dir)?;
    Ok(info)
}

/// Durably write only the metadata file of a snapshot whose data file already exists.
pub(crate) fn write_meta(dir: &Path, meta: &SnapshotMeta, timestamp: u64) -> Result<SnapshotInfo, StoreError> {
    let info = SnapshotInfo {
        term: meta.last_log_id.term,
        index: meta.last_log_id.index,
        timestamp,
    };

    let membership = codec::encode_membership(&meta.membership);
    let mut tail = Vec::with_capacity(16 + membership.len());
    tail.put_u64_le(meta.membership_index);
    tail.put_u64_le(membership.len() as u64);
    tail.extend_from_slice(&membership);

    let mut header = Vec::with_capacity(16);
    header.put_u64_le(SNAPSHOT_FORMAT);
    header.put_u64_le(crc32fast::hash(&tail) as u64);

    write_file(dir, &info.meta_filename(), &[&header, &tail])?;
    Ok(info)
}

/// Load and validate the metadata file of a snapshot.
pub(crate) fn load_meta(dir: &Path, info: &SnapshotInfo) -> Result<SnapshotMeta, StoreError> {
    let data = fs::read(dir.join(info.meta_filename()))?;
    let mut buf = data.as_slice();
    if buf.remaining() < 8 * 4 {
        return Err(StoreError::Malformed("snapshot metadata file truncated".into()));
    }
    let format = buf.get_u64_le();
    if format != SNAPSHOT_FORMAT {
        return Err(StoreError::Malformed(format!("unsupported snapshot format {}", format)));
    }
    let crc_stored = buf.get_u64_le();
    if crc32fast::hash(buf) as u64 != crc_stored {
        return Err(StoreError::Corrupt("snapshot metadata checksum mismatch".into()));
    }
    let membership_index = buf.get_u64_le();
    let membership_len = buf.get_u64_le();
    if membership_len > MAX_MEMBERSHIP_SIZE {
        return Err(StoreError::Corrupt(format!("snapshot configuration too big ({} bytes)", membership_len)));
    }
    if membership_len == 0 {
        return Err(StoreError::Corrupt("snapshot has no configuration data".into()));
    }
    if buf.remaining() != membership_len as usize {
        return Err(StoreError::Corrupt("snapshot configuration length mismatch".into()));
    }
    let membership = codec::decode_membership(buf)?;

    Ok(SnapshotMeta {
        last_log_id: LogId::new(info.term, info.index),
        membership,
        membership_index,
    })
}

/// Remove all snapshots except the two most recent ones.
///
/// `infos` must be sorted as returned by [`scan`].
pub(crate) fn keep_last_two(dir: &Path, infos: &[SnapshotInfo]) -> Result<(), StoreError> {
    if infos.len() <= 2 {
        return Ok(());
    }
    for info in &infos[..infos.len() - 2] {
        fs::remove_file(dir.join(info.meta_filename()))?;
        fs::remove_file(dir.join(info.data_filename()))?;
    }
    Ok(())
}

fn write_file(dir: &Path, name: &str, parts: &[&[u8]]) -> Result<(), StoreError> {
    let path = dir.join(name);
    let mut file = fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
    for part in parts {
        file.write_all(part)?;
    }
    file.sync_all()?;
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let handle = fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}
