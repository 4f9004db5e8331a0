//! Heartbeat-based failure detection.
//!
//! The gossip manager feeds the detector with the live members and every
//! message it receives, asks it which nodes to heartbeat each round, and
//! copies its suspicions into the local member's gossip record.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::config::FailureDetectorConfig;
use crate::{ClusterNode, ClusterNodeId};

/// Decides which nodes look dead from the local node's point of view.
pub trait FailureDetector: Send {
    /// Replaces the set of live members. `members` includes the local node.
    fn update_members(&mut self, local_id: ClusterNodeId, members: &[ClusterNode]);

    /// Nodes the local node should send a heartbeat to this round.
    fn heartbeat_targets(&self) -> Vec<ClusterNode>;

    /// Any message from `id` proves it is alive.
    fn on_heartbeat(&mut self, id: &ClusterNodeId);

    /// The transport failed to reach `id`.
    fn on_connect_failure(&mut self, id: &ClusterNodeId);

    /// Advances the detector by one gossip round.
    fn tick(&mut self);

    /// Returns false once `id` is suspected.
    fn is_alive(&self, id: &ClusterNodeId) -> bool;

    /// Nodes currently suspected.
    fn suspected(&self) -> BTreeSet<ClusterNodeId>;

    /// How many members must suspect a node before it is declared down.
    fn failure_quorum(&self) -> usize;
}

/// Each node monitors the `failure_quorum` members that precede it in
/// seniority order, wrapping around.
///
/// The node right after the coordinator therefore always monitors the
/// coordinator, so a dead coordinator is suspected by the node that takes
/// over its role.
#[derive(Debug)]
pub struct DefaultFailureDetector {
    config: FailureDetectorConfig,
    monitored: BTreeMap<ClusterNodeId, Monitored>,
}

#[derive(Debug)]
struct Monitored {
    node: ClusterNode,
    missed: u32,
}

impl DefaultFailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            monitored: BTreeMap::new(),
        }
    }

    /// Ids of the monitored nodes.
    pub fn monitored(&self) -> BTreeSet<ClusterNodeId> {
        self.monitored.keys().copied().collect()
    }
}

impl Default for DefaultFailureDetector {
    fn default() -> Self {
        Self::new(FailureDetectorConfig::default())
    }
}

impl FailureDetector for DefaultFailureDetector {
    fn update_members(&mut self, local_id: ClusterNodeId, members: &[ClusterNode]) {
        let mut ring: Vec<&ClusterNode> = members.iter().collect();
        ring.sort_by(|a, b| a.seniority_cmp(b));
        ring.dedup_by_key(|n| n.id);

        let Some(pos) = ring.iter().position(|n| n.id == local_id) else {
            self.monitored.clear();
            return;
        };

        let count = self.config.failure_quorum.min(ring.len() - 1);
        let mut next = BTreeMap::new();
        for step in 1..=count {
            let node = ring[(pos + ring.len() - step) % ring.len()];
            let missed = self.monitored.get(&node.id).map_or(0, |m| m.missed);
            next.insert(
                node.id,
                Monitored {
                    node: node.clone(),
                    missed,
                },
            );
        }

        if next.keys().ne(self.monitored.keys()) {
            debug!(
                "monitoring {:?}",
                next.keys().map(ToString::to_string).collect::<Vec<_>>()
            );
        }
        self.monitored = next;
    }

    fn heartbeat_targets(&self) -> Vec<ClusterNode> {
        self.monitored.values().map(|m| m.node.clone()).collect()
    }

    fn on_heartbeat(&mut self, id: &ClusterNodeId) {
        if let Some(m) = self.monitored.get_mut(id) {
            if m.missed >= self.config.heartbeat_loss_threshold {
                info!("node {} is reachable again", id);
            }
            m.missed = 0;
        }
    }

    fn on_connect_failure(&mut self, id: &ClusterNodeId) {
        if let Some(m) = self.monitored.get_mut(id) {
            m.missed = m.missed.max(self.config.heartbeat_loss_threshold);
        }
    }

    fn tick(&mut self) {
        let threshold = self.config.heartbeat_loss_threshold;
        for (id, m) in self.monitored.iter_mut() {
            m.missed = m.missed.saturating_add(1);
            if m.missed == threshold {
                info!("node {} missed {} heartbeats, suspecting", id, threshold);
            }
        }
    }

    fn is_alive(&self, id: &ClusterNodeId) -> bool {
        self.monitored
            .get(id)
            .is_none_or(|m| m.missed < self.config.heartbeat_loss_threshold)
    }

    fn suspected(&self) -> BTreeSet<ClusterNodeId> {
        self.monitored
            .iter()
            .filter(|(_, m)| m.missed >= self.config.heartbeat_loss_threshold)
            .map(|(id, _)| *id)
            .collect()
    }

    fn failure_quorum(&self) -> usize {
        self.config.failure_quorum
    }
}
