//! Log segment files and their entry-batch encoding.
//!
//! Entries live in segment files: closed segments named `<start>-<end>` holding a sealed range,
//! and open segments named `open-<counter>`, pre-allocated to a fixed size and renamed to their
//! closed form once sealed. Every segment starts with an 8-byte format header, followed by
//! CRC-protected batches of entries; the zero padding of a pre-allocated open segment reads as
//! an end-of-data marker.

use bytes::Buf;
use bytes::BufMut;
use keel_raft::raft::Entry;
use keel_raft::raft::EntryPayload;
use keel_raft::AppData;
use keel_raft::LogId;

use crate::error::StoreError;

/// On-disk format identifier, written as the first 8 bytes of every segment file.
pub(crate) const SEGMENT_FORMAT: u64 = 1;
/// Size of the per-file format header.
pub(crate) const SEGMENT_HEADER_SIZE: u64 = 8;

const KIND_NORMAL: u8 = 1;
const KIND_BARRIER: u8 = 2;
const KIND_CONFIG: u8 = 3;

fn kind_of<D: AppData>(payload: &EntryPayload<D>) -> u8 {
    match payload {
        EntryPayload::Normal(_) => KIND_NORMAL,
        EntryPayload::Barrier => KIND_BARRIER,
        EntryPayload::ConfigChange(_) => KIND_CONFIG,
    }
}

/// The name of a closed segment covering `[first, last]`.
pub(crate) fn closed_name(first: u64, last: u64) -> String {
    format!("{:016}-{:016}", first, last)
}

/// Parse a closed segment filename into its `(first, last)` range.
pub(crate) fn parse_closed_name(name: &str) -> Option<(u64, u64)> {
    let mut parts = name.splitn(2, '-');
    let first = parts.next()?.parse::<u64>().ok()?;
    let last = parts.next()?.parse::<u64>().ok()?;
    if first == 0 || last < first {
        return None;
    }
    Some((first, last))
}

/// The name of an open segment with the given counter.
pub(crate) fn open_name(counter: u64) -> String {
    format!("open-{}", counter)
}

/// Parse an open segment filename into its counter.
pub(crate) fn parse_open_name(name: &str) -> Option<u64> {
    name.strip_prefix("open-")?.parse::<u64>().ok()
}

/// Encode a batch of entries.
///
/// Layout: `crc u32 | n u32 | n × (term u64, index u64, kind u8, len u32) | payloads`, with the
/// crc computed over everything following it. An all-zero first word marks the end of data in a
/// pre-allocated file, which is why a batch count of zero is never written.
pub(crate) fn encode_batch<D: AppData>(entries: &[&Entry<D>]) -> Result<Vec<u8>, StoreError> {
    let mut body = Vec::new();
    body.put_u32_le(entries.len() as u32);
    let mut payloads = Vec::new();
    for entry in entries {
        let payload = serde_json::to_vec(&entry.payload)
            .map_err(|err| StoreError::Malformed(format!("entry payload failed to encode: {}", err)))?;
        body.put_u64_le(entry.log_id.term);
        body.put_u64_le(entry.log_id.index);
        body.put_u8(kind_of(&entry.payload));
        body.put_u32_le(payload.len() as u32);
        payloads.push(payload);
    }
    for payload in payloads {
        body.extend_from_slice(&payload);
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.put_u32_le(crc32fast::hash(&body));
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode all batches of a segment file.
///
/// With `tolerate_torn` (used for open segments), an invalid batch at the tail is taken to be
/// the leftover of a crash mid-append: decoding stops there and everything before it is kept.
/// For closed segments any invalid batch means corruption.
pub(crate) fn decode_segment<D: AppData>(data: &[u8], tolerate_torn: bool) -> Result<Vec<Entry<D>>, StoreError> {
    let mut buf = data;
    if buf.remaining() < SEGMENT_HEADER_SIZE as usize {
        return Err(StoreError::Malformed("segment file shorter than its header".into()));
    }
    let format = buf.get_u64_le();
    if format != SEGMENT_FORMAT {
        return Err(StoreError::Malformed(format!("unsupported segment format {}", format)));
    }

    let mut entries = Vec::new();
    loop {
        if buf.remaining() < 8 {
            break;
        }
        let crc_stored = buf.get_u32_le();
        let batch = match decode_batch_body(buf, crc_stored) {
            Ok(Some((batch, consumed))) => {
                buf.advance(consumed);
                batch
            }
            Ok(None) => break, // Zero padding: end of data.
            Err(err) => {
                if tolerate_torn {
                    tracing::warn!(error=%err, "discarding torn batch at tail of open segment");
                    break;
                }
                return Err(err);
            }
        };
        entries.extend(batch);
    }
    Ok(entries)
}

/// Decode one batch body; `Ok(None)` marks the zero end-of-data padding.
///
/// `body` starts right after the batch's crc word; on success the returned length is how many
/// of its bytes the batch occupied.
fn decode_batch_body<D: AppData>(
    body: &[u8],
    crc_stored: u32,
) -> Result<Option<(Vec<Entry<D>>, usize)>, StoreError> {
    let mut cursor = body;
    if cursor.remaining() < 4 {
        return Err(StoreError::Corrupt("segment batch count truncated".into()));
    }
    let n = cursor.get_u32_le();
    if crc_stored == 0 && n == 0 {
        return Ok(None);
    }

    let header_size = (n as usize) * (8 + 8 + 1 + 4);
    if cursor.remaining() < header_size {
        return Err(StoreError::Corrupt("segment batch header truncated".into()));
    }
    let mut headers = Vec::with_capacity(n as usize);
    let mut payload_total = 0usize;
    for _ in 0..n {
        let term = cursor.get_u64_le();
        let index = cursor.get_u64_le();
        let kind = cursor.get_u8();
        let len = cursor.get_u32_le() as usize;
        payload_total += len;
        headers.push((term, index, kind, len));
    }
    if cursor.remaining() < payload_total {
        return Err(StoreError::Corrupt("segment batch payload truncated".into()));
    }

    // The full extent of the batch is known; verify its checksum before trusting any of it.
    let body_len = 4 + header_size + payload_total;
    if crc32fast::hash(&body[..body_len]) != crc_stored {
        return Err(StoreError::Corrupt("segment batch checksum mismatch".into()));
    }

    let mut entries = Vec::with_capacity(n as usize);
    for (term, index, kind, len) in headers {
        let payload: EntryPayload<D> = serde_json::from_slice(&cursor[..len])
            .map_err(|err| StoreError::Corrupt(format!("entry payload failed to decode: {}", err)))?;
        if kind_of(&payload) != kind {
            return Err(StoreError::Corrupt(format!(
                "entry kind byte {} does not match payload at index {}",
                kind, index
            )));
        }
        cursor.advance(len);
        entries.push(Entry {
            log_id: LogId::new(term, index),
            payload,
        });
    }

    Ok(Some((entries, body_len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_raft::raft::EntryNormal;
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Payload(String);
    impl keel_raft::AppData for Payload {}

    fn entry(term: u64, index: u64) -> Entry<Payload> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(EntryNormal {
                data: Payload(format!("payload-{}", index)),
            }),
        }
    }

    fn segment_bytes(batches: &[Vec<Entry<Payload>>]) -> Vec<u8> {
        let mut data = Vec::new();
        data.put_u64_le(SEGMENT_FORMAT);
        for batch in batches {
            let refs: Vec<_> = batch.iter().collect();
            data.extend_from_slice(&encode_batch(&refs).unwrap());
        }
        data
    }

    #[test]
    fn batches_round_trip() {
        let batches = vec![vec![entry(1, 1), entry(1, 2)], vec![entry(2, 3)]];
        let data = segment_bytes(&batches);
        let decoded: Vec<Entry<Payload>> = decode_segment(&data, false).unwrap();
        let expected: Vec<_> = batches.into_iter().flatten().collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn zero_padding_terminates_decoding() {
        let mut data = segment_bytes(&[vec![entry(1, 1)]]);
        data.extend_from_slice(&[0u8; 256]);
        let decoded: Vec<Entry<Payload>> = decode_segment(&data, false).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn corrupt_batch_is_fatal_for_closed_segments() {
        let mut data = segment_bytes(&[vec![entry(1, 1)]]);
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(decode_segment::<Payload>(&data, false).is_err());
    }

    #[test]
    fn torn_tail_is_discarded_for_open_segments() {
        let mut data = segment_bytes(&[vec![entry(1, 1)]]);
        // A second batch whose payload got cut off by a crash.
        let torn = segment_bytes(&[vec![entry(1, 2)]]);
        data.extend_from_slice(&torn[SEGMENT_HEADER_SIZE as usize..torn.len() - 3]);
        let decoded: Vec<Entry<Payload>> = decode_segment(&data, true).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].log_id, LogId::new(1, 1));
    }

    #[test]
    fn closed_segment_names_round_trip() {
        let name = closed_name(7, 123);
        assert_eq!(parse_closed_name(&name), Some((7, 123)));
        assert_eq!(parse_closed_name("open-3"), None);
        assert_eq!(parse_open_name("open-3"), Some(3));
        assert_eq!(parse_open_name(&name), None);
    }
}
