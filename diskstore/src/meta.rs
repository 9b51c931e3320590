//! The `metadata1`/`metadata2` record pair.
//!
//! The store's term, vote and log start index live in a fixed-size record written alternately
//! to two files, so that a torn write can never destroy the previous record. The loader picks
//! the valid record with the highest version.

use std::fs;
use std::io::Write;
use std::path::Path;

use bytes::Buf;
use bytes::BufMut;

use crate::error::StoreError;

/// On-disk format identifier of the metadata record.
const META_FORMAT: u64 = 1;
/// Serialized size: five u64 words plus a crc32.
const META_SIZE: usize = 8 * 5 + 4;

/// The contents of a metadata record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MetaRecord {
    /// Monotonic record version; its parity selects which file the record is written to.
    pub version: u64,
    /// The current term.
    pub term: u64,
    /// The server voted for in the current term; 0 when none.
    pub voted_for: u64,
    /// The index of the first entry present in the log (entries below it are compacted).
    pub start_index: u64,
}

impl MetaRecord {
    fn filename(&self) -> &'static str {
        if self.version % 2 == 1 {
            "metadata1"
        } else {
            "metadata2"
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_SIZE);
        buf.put_u64_le(META_FORMAT);
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.voted_for);
        buf.put_u64_le(self.start_index);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<MetaRecord, StoreError> {
        if buf.len() != META_SIZE {
            return Err(StoreError::Malformed(format!("metadata record has size {}", buf.len())));
        }
        let crc_expected = crc32fast::hash(&buf[..META_SIZE - 4]);
        let format = buf.get_u64_le();
        if format != META_FORMAT {
            return Err(StoreError::Malformed(format!("unsupported metadata format {}", format)));
        }
        let record = MetaRecord {
            version: buf.get_u64_le(),
            term: buf.get_u64_le(),
            voted_for: buf.get_u64_le(),
            start_index: buf.get_u64_le(),
        };
        let crc_stored = buf.get_u32_le();
        if crc_stored != crc_expected {
            return Err(StoreError::Corrupt("metadata record checksum mismatch".into()));
        }
        Ok(record)
    }
}

/// Durably write the given record to the file selected by its version parity.
pub(crate) fn store(dir: &Path, record: &MetaRecord) -> Result<(), StoreError> {
    let path = dir.join(record.filename());
    let mut file = fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
    file.write_all(&record.encode())?;
    file.sync_all()?;
    Ok(())
}

/// Load the most recent valid metadata record, if any.
///
/// A record which fails its integrity check is treated as the leftover of a torn write and
/// ignored in favor of its sibling; only when no valid record remains while metadata files do
/// exist is the store considered corrupt.
pub(crate) fn load(dir: &Path) -> Result<Option<MetaRecord>, StoreError> {
    let mut best: Option<MetaRecord> = None;
    let mut saw_file = false;
    let mut saw_invalid = false;

    for name in &["metadata1", "metadata2"] {
        let path = dir.join(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        saw_file = true;
        match MetaRecord::decode(&data) {
            Ok(record) => {
                if best.map(|b| record.version > b.version).unwrap_or(true) {
                    best = Some(record);
                }
            }
            Err(err) => {
                tracing::warn!(file=%name, error=%err, "ignoring invalid metadata record");
                saw_invalid = true;
            }
        }
    }

    if best.is_none() && saw_file && saw_invalid {
        return Err(StoreError::Corrupt("no valid metadata record found".into()));
    }
    Ok(best)
}
