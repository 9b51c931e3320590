//! Cluster membership configuration.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ChangeConfigError;
use crate::NodeId;

/// The role a server plays in the cluster configuration.
///
/// Only voters count toward quorum and may vote in elections. Stand-bys and spares receive log
/// entries but never initiate elections; a spare is typically a freshly added server which has
/// not yet been assigned a working role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Voter,
    Standby,
    Spare,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Voter => write!(f, "voter"),
            Role::Standby => write!(f, "stand-by"),
            Role::Spare => write!(f, "spare"),
        }
    }
}

/// A single server of the cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The server's unique, nonzero ID.
    pub id: NodeId,
    /// The network address of the server, as understood by the `RaftNetwork` implementation.
    pub address: String,
    /// The server's role.
    pub role: Role,
}

impl Server {
    pub fn new(id: NodeId, address: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            address: address.into(),
            role,
        }
    }
}

/// The membership configuration of the cluster: an ordered list of servers.
///
/// A configuration is stored in the log as a regular entry and in snapshot metadata. It takes
/// effect — for quorum and election purposes — as soon as it is appended to the log, not when it
/// is committed. This is the reason at most one configuration change may be in flight at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub servers: Vec<Server>,
}

impl Membership {
    /// Create a new membership config from the given servers.
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Get the server bearing the given ID.
    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Get the position of the server bearing the given ID in the ordered server list.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// Check if the given ID exists in this membership config.
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Check if the server bearing the given ID is a voter.
    pub fn is_voter(&self, id: NodeId) -> bool {
        matches!(self.get(id), Some(s) if s.role == Role::Voter)
    }

    /// An iterator over the voters of this config.
    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.role == Role::Voter)
    }

    /// The IDs of all voters of this config.
    pub fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.voters().map(|s| s.id).collect()
    }

    /// The IDs of all servers of this config.
    pub fn all_ids(&self) -> BTreeSet<NodeId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// Build a copy of this config with the given server appended as a spare.
    pub fn with_server_added(&self, id: NodeId, address: &str) -> Result<Membership, ChangeConfigError> {
        if id == 0 {
            return Err(ChangeConfigError::BadId(id));
        }
        if self.contains(id) {
            return Err(ChangeConfigError::BadId(id));
        }
        let mut servers = self.servers.clone();
        servers.push(Server::new(id, address, Role::Spare));
        Ok(Membership { servers })
    }

    /// Build a copy of this config with the given server assigned the given role.
    ///
    /// The caller is responsible for having validated that the server exists.
    pub fn with_role(&self, id: NodeId, role: Role) -> Membership {
        let mut servers = self.servers.clone();
        if let Some(server) = servers.iter_mut().find(|s| s.id == id) {
            server.role = role;
        }
        Membership { servers }
    }

    /// Build a copy of this config without the given server, preserving order.
    pub fn with_server_removed(&self, id: NodeId) -> Membership {
        let servers = self.servers.iter().filter(|s| s.id != id).cloned().collect();
        Membership { servers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters() -> Membership {
        Membership::new(vec![
            Server::new(1, "addr1", Role::Voter),
            Server::new(2, "addr2", Role::Voter),
            Server::new(3, "addr3", Role::Voter),
        ])
    }

    #[test]
    fn test_queries() {
        let m = three_voters();
        assert!(m.contains(2));
        assert!(!m.contains(4));
        assert!(m.is_voter(1));
        assert_eq!(m.index_of(3), Some(2));
        assert_eq!(m.voter_ids().len(), 3);
    }

    #[test]
    fn test_add_appends_spare_in_order() {
        let m = three_voters().with_server_added(4, "addr4").unwrap();
        assert_eq!(m.servers.len(), 4);
        let last = m.servers.last().unwrap();
        assert_eq!(last.id, 4);
        assert_eq!(last.role, Role::Spare);
        assert!(!m.is_voter(4));
    }

    #[test]
    fn test_add_rejects_zero_and_duplicate_ids() {
        let m = three_voters();
        assert!(matches!(m.with_server_added(0, "addr0"), Err(ChangeConfigError::BadId(0))));
        assert!(matches!(m.with_server_added(2, "addr2"), Err(ChangeConfigError::BadId(2))));
    }

    #[test]
    fn test_remove_preserves_order() {
        let m = three_voters().with_server_removed(2);
        let ids: Vec<_> = m.servers.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_assign_role() {
        let m = three_voters().with_server_added(4, "addr4").unwrap().with_role(4, Role::Voter);
        assert!(m.is_voter(4));
        assert_eq!(m.voter_ids().len(), 4);
    }
}
