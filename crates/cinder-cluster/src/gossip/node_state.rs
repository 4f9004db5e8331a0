//! Per-member gossip record.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{ClusterNode, ClusterNodeId};

/// Membership status of a node.
///
/// Declaration order is the lifecycle order and is used as the tie-break
/// when two records of the same node carry the same version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GossipNodeStatus {
    /// Accepted by some member, waiting for the coordinator to promote it.
    Joining,
    /// Full member.
    Up,
    /// Leaving gracefully, waiting for the coordinator to mark it down.
    Leaving,
    /// Failed or left. Terminal until purged.
    Down,
}

impl GossipNodeStatus {
    /// Returns true for every status except `Down`.
    pub fn is_active(self) -> bool {
        self != GossipNodeStatus::Down
    }
}

impl std::fmt::Display for GossipNodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GossipNodeStatus::Joining => write!(f, "joining"),
            GossipNodeStatus::Up => write!(f, "up"),
            GossipNodeStatus::Leaving => write!(f, "leaving"),
            GossipNodeStatus::Down => write!(f, "down"),
        }
    }
}

/// Orders two descriptions of the same node: larger join order first, then
/// the remaining fields, so either merge direction picks the same one.
fn tie_key(
    node: &ClusterNode,
) -> (u32, SocketAddr, &str, &BTreeSet<String>, &BTreeMap<String, String>) {
    (
        node.join_order,
        node.address,
        &node.name,
        &node.roles,
        &node.properties,
    )
}

/// Immutable view of one member as disseminated by gossip.
///
/// Every modifier returns a new value; the caller decides when to bump the
/// version via [`next_version`](Self::next_version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipNodeState {
    node: ClusterNode,
    status: GossipNodeStatus,
    version: u64,
    suspected: BTreeSet<ClusterNodeId>,
}

impl GossipNodeState {
    /// Creates the first record for a node.
    pub fn new(node: ClusterNode, status: GossipNodeStatus) -> Self {
        Self {
            node,
            status,
            version: 1,
            suspected: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> ClusterNodeId {
        self.node.id
    }

    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    pub fn status(&self) -> GossipNodeStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn join_order(&self) -> u32 {
        self.node.join_order
    }

    pub fn suspected(&self) -> &BTreeSet<ClusterNodeId> {
        &self.suspected
    }

    /// Returns true if this member suspects `id`.
    pub fn is_suspected(&self, id: &ClusterNodeId) -> bool {
        self.suspected.contains(id)
    }

    /// Returns true if this member suspects anybody.
    pub fn has_suspected(&self) -> bool {
        !self.suspected.is_empty()
    }

    /// Merges two records of the same node.
    ///
    /// The higher version wins outright. On a version tie the result takes
    /// the later status, the union of suspicions and the node description
    /// with the larger join order (other fields break a remaining tie), which
    /// depends only on the two inputs and so is commutative.
    ///
    /// # Panics
    ///
    /// Panics if the records describe different nodes.
    pub fn merge(&self, other: &GossipNodeState) -> GossipNodeState {
        assert_eq!(self.id(), other.id(), "can't merge states of different nodes");

        if self.version > other.version {
            return self.clone();
        }
        if other.version > self.version {
            return other.clone();
        }
        if self == other {
            return self.clone();
        }

        let node = if tie_key(&self.node) >= tie_key(&other.node) {
            self.node.clone()
        } else {
            other.node.clone()
        };

        GossipNodeState {
            node,
            status: self.status.max(other.status),
            version: self.version,
            suspected: self.suspected.union(&other.suspected).copied().collect(),
        }
    }

    /// Returns a copy with the given ids removed from `suspected`.
    pub fn unsuspected<'a>(&self, ids: impl IntoIterator<Item = &'a ClusterNodeId>) -> Self {
        let mut suspected = self.suspected.clone();
        for id in ids {
            suspected.remove(id);
        }
        Self {
            suspected,
            ..self.clone()
        }
    }

    /// Returns a copy suspecting exactly `ids`.
    ///
    /// # Panics
    ///
    /// Panics if `ids` contains this node's own id.
    pub fn suspect(&self, ids: BTreeSet<ClusterNodeId>) -> Self {
        assert!(!ids.contains(&self.id()), "node can't suspect itself");
        Self {
            suspected: ids,
            ..self.clone()
        }
    }

    /// Returns a copy with a new status.
    pub fn with_status(&self, status: GossipNodeStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Returns a copy with a new join order.
    pub fn with_join_order(&self, join_order: u32) -> Self {
        Self {
            node: self.node.with_join_order(join_order),
            ..self.clone()
        }
    }

    /// Returns a copy with the version incremented.
    pub fn next_version(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}
