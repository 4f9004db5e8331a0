//! Node identity.
//!
//! A node is identified by a random [`ClusterNodeId`] created at startup and
//! described by a [`ClusterNode`]: its address, name, roles, properties and
//! the join order assigned by the coordinator once it becomes `UP`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a cluster node.
///
/// Wraps a UUID v4. The total order over ids is the final tie-break for
/// coordinator selection, so it must be identical on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNodeId(pub Uuid);

impl ClusterNodeId {
    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a node ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Raw bytes of the id, used for hashing.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ClusterNodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClusterNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // first 8 chars, like git short hashes
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Information about a single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Unique node identifier.
    pub id: ClusterNodeId,
    /// Address used by the gossip transport.
    pub address: SocketAddr,
    /// Human-readable name, may be empty.
    pub name: String,
    /// Application-defined roles.
    pub roles: BTreeSet<String>,
    /// Application-defined properties.
    pub properties: BTreeMap<String, String>,
    /// Position in the order nodes joined the cluster. Zero until the
    /// coordinator promotes the node to `UP`.
    pub join_order: u32,
}

impl ClusterNode {
    /// Creates a node with no name, roles or properties.
    pub fn new(id: ClusterNodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            name: String::new(),
            roles: BTreeSet::new(),
            properties: BTreeMap::new(),
            join_order: 0,
        }
    }

    /// Sets the node name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Adds a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns a copy with the given join order.
    pub fn with_join_order(&self, join_order: u32) -> Self {
        Self {
            join_order,
            ..self.clone()
        }
    }

    /// Returns true if the node carries the role.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Returns true once the coordinator has assigned a join order.
    pub fn is_joined(&self) -> bool {
        self.join_order > 0
    }

    /// Order used for coordinator selection and topology listings: nodes
    /// with an assigned join order first (oldest first), then by id.
    pub fn seniority_cmp(&self, other: &ClusterNode) -> Ordering {
        let key = |n: &ClusterNode| (n.join_order == 0, n.join_order, n.id);
        key(self).cmp(&key(other))
    }
}

impl std::fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}@{}", self.id, self.address)
        } else {
            write!(f, "{}({})@{}", self.name, self.id, self.address)
        }
    }
}
