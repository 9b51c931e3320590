//! Versioned little-endian encoding of membership configurations.
//!
//! The encoding is part of the on-disk contract: it is embedded in snapshot metadata files and
//! in configuration log entries written by other implementations of the same layout. All
//! integers are little-endian with explicit lengths.

use bytes::Buf;
use bytes::BufMut;
use keel_raft::Membership;
use keel_raft::Role;
use keel_raft::Server;

use crate::error::StoreError;

/// The current encoding version.
const ENCODING_VERSION: u8 = 1;

const ROLE_VOTER: u8 = 1;
const ROLE_STANDBY: u8 = 2;
const ROLE_SPARE: u8 = 3;

fn role_to_byte(role: Role) -> u8 {
    match role {
        Role::Voter => ROLE_VOTER,
        Role::Standby => ROLE_STANDBY,
        Role::Spare => ROLE_SPARE,
    }
}

fn role_from_byte(byte: u8) -> Result<Role, StoreError> {
    match byte {
        ROLE_VOTER => Ok(Role::Voter),
        ROLE_STANDBY => Ok(Role::Standby),
        ROLE_SPARE => Ok(Role::Spare),
        _ => Err(StoreError::Malformed(format!("unknown server role byte {}", byte))),
    }
}

/// Encode a membership configuration.
///
/// Layout: `version u8 | n u64 | n × (id u64, role u8, addr_len u16, addr bytes)`.
pub(crate) fn encode_membership(membership: &Membership) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u8(ENCODING_VERSION);
    buf.put_u64_le(membership.servers.len() as u64);
    for server in &membership.servers {
        buf.put_u64_le(server.id);
        buf.put_u8(role_to_byte(server.role));
        buf.put_u16_le(server.address.len() as u16);
        buf.put_slice(server.address.as_bytes());
    }
    buf
}

/// Decode a membership configuration, yielding exactly the servers that were encoded.
pub(crate) fn decode_membership(mut buf: &[u8]) -> Result<Membership, StoreError> {
    if buf.remaining() < 1 {
        return Err(StoreError::Malformed("membership data is empty".into()));
    }
    let version = buf.get_u8();
    if version != ENCODING_VERSION {
        return Err(StoreError::Malformed(format!("unsupported membership encoding version {}", version)));
    }
    if buf.remaining() < 8 {
        return Err(StoreError::Malformed("membership data truncated".into()));
    }
    let n = buf.get_u64_le();

    let mut servers = Vec::with_capacity(n as usize);
    for _ in 0..n {
        if buf.remaining() < 8 + 1 + 2 {
            return Err(StoreError::Malformed("membership server record truncated".into()));
        }
        let id = buf.get_u64_le();
        let role = role_from_byte(buf.get_u8())?;
        let addr_len = buf.get_u16_le() as usize;
        if buf.remaining() < addr_len {
            return Err(StoreError::Malformed("membership server address truncated".into()));
        }
        let address = String::from_utf8(buf[..addr_len].to_vec())
            .map_err(|_| StoreError::Malformed("membership server address is not utf-8".into()))?;
        buf.advance(addr_len);
        servers.push(Server { id, address, role });
    }
    if buf.has_remaining() {
        return Err(StoreError::Malformed("trailing bytes after membership data".into()));
    }
    Ok(Membership::new(servers))
}
