//! Cluster topology snapshots and change events.
//!
//! A [`ClusterTopology`] is the set of non-DOWN members as seen by the
//! local node, ordered by seniority. Its [`ClusterHash`] identifies the
//! member set so that replies computed against one topology can be told
//! apart from replies computed against another.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ClusterNode, ClusterNodeId};

/// SHA-256 digest of the sorted member ids of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterHash([u8; 32]);

impl ClusterHash {
    /// Hashes a set of node ids. Input order doesn't matter.
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a ClusterNodeId>) -> Self {
        let sorted: BTreeSet<&ClusterNodeId> = ids.into_iter().collect();
        let mut hasher = Sha256::new();
        for id in sorted {
            hasher.update(id.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ClusterHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Immutable snapshot of the live cluster members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    local_id: ClusterNodeId,
    nodes: Vec<ClusterNode>,
    hash: ClusterHash,
}

impl ClusterTopology {
    /// Builds a topology; nodes are sorted by seniority.
    pub fn new(local_id: ClusterNodeId, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by(|a, b| a.seniority_cmp(b));
        nodes.dedup_by_key(|n| n.id);
        let hash = ClusterHash::of(nodes.iter().map(|n| &n.id));
        Self {
            local_id,
            nodes,
            hash,
        }
    }

    /// Topology of a node that hasn't joined anything yet.
    pub fn empty(local_id: ClusterNodeId) -> Self {
        Self::new(local_id, Vec::new())
    }

    pub fn local_id(&self) -> ClusterNodeId {
        self.local_id
    }

    /// The local node, if it is a member.
    pub fn local_node(&self) -> Option<&ClusterNode> {
        self.get(&self.local_id)
    }

    /// Returns true if the local node is part of this topology.
    pub fn is_joined(&self) -> bool {
        self.local_node().is_some()
    }

    /// Members, oldest first.
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn hash(&self) -> ClusterHash {
        self.hash
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &ClusterNodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    pub fn contains(&self, id: &ClusterNodeId) -> bool {
        self.get(id).is_some()
    }

    /// The most senior member.
    pub fn oldest(&self) -> Option<&ClusterNode> {
        self.nodes.first()
    }

    /// Member ids.
    pub fn ids(&self) -> BTreeSet<ClusterNodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Returns a topology restricted to nodes matching `pred`.
    ///
    /// The hash is recomputed over the remaining nodes.
    pub fn filter(&self, pred: impl Fn(&ClusterNode) -> bool) -> ClusterTopology {
        ClusterTopology::new(
            self.local_id,
            self.nodes.iter().filter(|n| pred(n)).cloned().collect(),
        )
    }

    /// Returns a topology of the nodes carrying `role`.
    pub fn with_role(&self, role: &str) -> ClusterTopology {
        self.filter(|n| n.has_role(role))
    }
}

impl std::fmt::Display for ClusterTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[hash={}, nodes=", self.hash)?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", node)?;
        }
        write!(f, "]")
    }
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEventKind {
    /// The local node joined the cluster.
    Join,
    /// Nodes joined or left while the local node is a member.
    Change,
    /// The local node left the cluster.
    Leave,
}

/// A membership change as observed by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    pub topology: ClusterTopology,
    pub added: Vec<ClusterNode>,
    pub removed: Vec<ClusterNode>,
}

impl ClusterEvent {
    /// Computes the event between two consecutive topologies.
    ///
    /// Returns `None` when the member sets are the same.
    pub fn between(prev: &ClusterTopology, next: &ClusterTopology) -> Option<ClusterEvent> {
        if prev.hash == next.hash && prev.nodes == next.nodes {
            return None;
        }

        let added: Vec<ClusterNode> = next
            .nodes
            .iter()
            .filter(|n| !prev.contains(&n.id))
            .cloned()
            .collect();
        let removed: Vec<ClusterNode> = prev
            .nodes
            .iter()
            .filter(|n| !next.contains(&n.id))
            .cloned()
            .collect();

        let kind = match (prev.is_joined(), next.is_joined()) {
            (false, true) => ClusterEventKind::Join,
            (true, false) => ClusterEventKind::Leave,
            (false, false) => return None,
            (true, true) => {
                // node metadata change (join order) without membership change
                if added.is_empty() && removed.is_empty() {
                    return None;
                }
                ClusterEventKind::Change
            }
        };

        Some(ClusterEvent {
            kind,
            topology: next.clone(),
            added,
            removed,
        })
    }

    pub fn is_join(&self) -> bool {
        self.kind == ClusterEventKind::Join
    }

    pub fn is_leave(&self) -> bool {
        self.kind == ClusterEventKind::Leave
    }
}
