//! Gossip membership manager.
//!
//! The manager owns the local node's gossip view and runs the protocol
//! without doing any I/O: [`tick`](GossipManager::tick) and
//! [`handle_message`](GossipManager::handle_message) return the messages to
//! send, and topology changes are emitted on an event channel.
//!
//! # Protocol round
//!
//! While joining, each round dials one seed (or forms a new cluster when no
//! seed can take us in). Once a member, each round:
//! 1. feeds the failure detector and publishes the local suspicions
//! 2. lets the coordinator, if the view is convergent, make one change:
//!    purge DOWN nodes, mark failed nodes DOWN, move LEAVING nodes to DOWN
//!    or promote JOINING nodes to UP
//! 3. sends the view to a few random peers and heartbeats to the nodes
//!    the failure detector monitors

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::prelude::IndexedRandom;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

use crate::config::{ClusterConfig, GossipConfig};
use crate::failure::FailureDetector;
use crate::gossip::{Gossip, GossipNodeState, GossipNodeStatus, GossipPrecedence};
use crate::message::{GossipMessage, JoinRejectKind};
use crate::seeds::GossipSeedNodesState;
use crate::topology::{ClusterEvent, ClusterEventKind, ClusterTopology};
use crate::{ClusterNode, ClusterNodeId};

/// Messages to send, paired with their destination.
pub type Outgoing = Vec<(SocketAddr, GossipMessage)>;

/// Where the local node is in its membership lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    /// `join` hasn't been called.
    Idle,
    /// Dialing seed nodes.
    Joining,
    /// Member of a cluster (JOINING or UP in gossip).
    Joined,
    /// LEAVING in gossip, waiting for the coordinator to mark us DOWN.
    Leaving,
    /// Out of the cluster. Terminal.
    Left,
}

/// Sans-IO gossip protocol state machine for one node.
pub struct GossipManager {
    local: ClusterNode,
    cluster_name: String,
    config: GossipConfig,
    status: MembershipStatus,
    gossip: Arc<Gossip>,
    seeds: GossipSeedNodesState,
    /// Seed dialed by the last join attempt, until it answers.
    pending_join: Option<SocketAddr>,
    last_join_attempt: Option<Instant>,
    detector: Box<dyn FailureDetector>,
    topology: ClusterTopology,
    event_tx: mpsc::Sender<ClusterEvent>,
}

impl std::fmt::Debug for GossipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipManager")
            .field("local", &self.local)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl GossipManager {
    /// Creates a manager for `local`. Call [`join`](Self::join) to start.
    pub fn new(
        local: ClusterNode,
        config: &ClusterConfig,
        detector: Box<dyn FailureDetector>,
        event_tx: mpsc::Sender<ClusterEvent>,
    ) -> Self {
        let local = local.with_join_order(0);
        Self {
            seeds: GossipSeedNodesState::new(local.address, []),
            topology: ClusterTopology::empty(local.id),
            local,
            cluster_name: config.cluster_name.clone(),
            config: config.gossip.clone(),
            status: MembershipStatus::Idle,
            gossip: Arc::new(Gossip::new()),
            pending_join: None,
            last_join_attempt: None,
            detector,
            event_tx,
        }
    }

    pub fn local_id(&self) -> ClusterNodeId {
        self.local.id
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    pub fn status(&self) -> MembershipStatus {
        self.status
    }

    /// Current gossip view.
    pub fn gossip(&self) -> Arc<Gossip> {
        Arc::clone(&self.gossip)
    }

    /// Last published topology.
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn seeds(&self) -> &GossipSeedNodesState {
        &self.seeds
    }

    pub fn is_joining(&self) -> bool {
        self.status == MembershipStatus::Joining
    }

    pub fn is_terminated(&self) -> bool {
        self.status == MembershipStatus::Left
    }

    /// Starts joining through the given seed addresses.
    pub fn join(&mut self, seeds: impl IntoIterator<Item = SocketAddr>) {
        if self.status != MembershipStatus::Idle {
            warn!("join called twice on {}", self.local);
            return;
        }
        self.seeds = GossipSeedNodesState::new(self.local.address, seeds);
        self.status = MembershipStatus::Joining;
        info!(
            "node {} joining cluster '{}' ({} seeds)",
            self.local,
            self.cluster_name,
            self.seeds.seeds().len() - 1
        );
    }

    /// Replaces the seed addresses, keeping what we learned about known ones.
    pub fn update_seeds(&mut self, seeds: impl IntoIterator<Item = SocketAddr>) {
        self.seeds.update(seeds);
    }

    /// Starts a graceful leave.
    ///
    /// A node that hasn't joined yet leaves immediately. A member switches
    /// to LEAVING and keeps gossiping until the coordinator marks it DOWN.
    pub fn leave(&mut self) {
        match self.status {
            MembershipStatus::Idle | MembershipStatus::Joining => {
                info!("node {} stopped before joining", self.local);
                self.pending_join = None;
                self.status = MembershipStatus::Left;
            }
            MembershipStatus::Joined => {
                let local_id = self.local.id;
                if let Some(state) = self.gossip.member(&local_id) {
                    let leaving = state
                        .with_status(GossipNodeStatus::Leaving)
                        .next_version();
                    self.replace_gossip(self.gossip.update(&local_id, leaving));
                }
                self.status = MembershipStatus::Leaving;
                info!("node {} leaving cluster '{}'", self.local, self.cluster_name);
            }
            MembershipStatus::Leaving | MembershipStatus::Left => {}
        }
    }

    /// Runs one protocol round.
    pub fn tick(&mut self) -> Outgoing {
        match self.status {
            MembershipStatus::Idle | MembershipStatus::Left => Vec::new(),
            MembershipStatus::Joining => self.join_round(),
            MembershipStatus::Joined | MembershipStatus::Leaving => self.member_round(),
        }
    }

    /// The transport couldn't deliver a message to `addr`.
    pub fn on_unreachable(&mut self, addr: SocketAddr) {
        if self.pending_join == Some(addr) {
            debug!("seed {} unreachable", addr);
            self.pending_join = None;
            self.seeds.on_failure(addr);
            return;
        }
        let target = self
            .gossip
            .members()
            .values()
            .find(|m| m.node().address == addr)
            .map(GossipNodeState::id);
        if let Some(id) = target {
            self.detector.on_connect_failure(&id);
        }
    }

    /// Handles an incoming message and returns the replies.
    pub fn handle_message(&mut self, msg: GossipMessage, from: SocketAddr) -> Outgoing {
        trace!("received {} from {} ({})", msg.kind(), msg.sender(), from);

        if matches!(self.status, MembershipStatus::Idle | MembershipStatus::Left) {
            return Vec::new();
        }

        match msg {
            GossipMessage::JoinRequest { cluster, node } => {
                self.handle_join_request(cluster, node, from)
            }
            GossipMessage::JoinAccept { sender, gossip } => {
                self.handle_join_accept(sender, gossip, from)
            }
            GossipMessage::JoinReject { kind, reason, .. } => {
                self.handle_join_reject(kind, reason, from);
                Vec::new()
            }
            GossipMessage::Update { sender, gossip } => self.handle_update(sender, gossip, from),
            GossipMessage::HeartbeatRequest { sender } => {
                self.detector.on_heartbeat(&sender);
                if self.is_member() {
                    vec![(
                        from,
                        GossipMessage::HeartbeatReply {
                            sender: self.local.id,
                        },
                    )]
                } else {
                    Vec::new()
                }
            }
            GossipMessage::HeartbeatReply { sender } => {
                self.detector.on_heartbeat(&sender);
                Vec::new()
            }
        }
    }

    fn is_member(&self) -> bool {
        matches!(
            self.status,
            MembershipStatus::Joined | MembershipStatus::Leaving
        )
    }

    fn replace_gossip(&mut self, gossip: Gossip) {
        if *self.gossip != gossip {
            self.gossip = Arc::new(gossip);
        }
    }

    // -- joining --

    fn join_round(&mut self) -> Outgoing {
        let now = Instant::now();
        if let Some(at) = self.last_join_attempt {
            if now.duration_since(at) < self.config.seed_retry_interval() {
                return Vec::new();
            }
        }

        if let Some(addr) = self.pending_join.take() {
            debug!("seed {} did not answer the join request", addr);
            self.seeds.on_failure(addr);
        }

        if self.seeds.is_self_join() {
            self.self_join();
            return self.member_round();
        }

        match self.seeds.next_seed() {
            Some(addr) => {
                debug!("sending join request to seed {}", addr);
                self.pending_join = Some(addr);
                self.last_join_attempt = Some(now);
                vec![(
                    addr,
                    GossipMessage::JoinRequest {
                        cluster: self.cluster_name.clone(),
                        node: self.local.clone(),
                    },
                )]
            }
            None => Vec::new(),
        }
    }

    fn self_join(&mut self) {
        let local_id = self.local.id;
        let state = GossipNodeState::new(self.local.with_join_order(1), GossipNodeStatus::Up);
        self.gossip = Arc::new(Gossip::new().update(&local_id, state));
        self.pending_join = None;
        self.status = MembershipStatus::Joined;
        info!(
            "no seed node accepted {}, formed new cluster '{}'",
            self.local, self.cluster_name
        );
    }

    fn handle_join_request(
        &mut self,
        cluster: String,
        node: ClusterNode,
        from: SocketAddr,
    ) -> Outgoing {
        let local_id = self.local.id;
        let reject = |kind: JoinRejectKind, reason: String| {
            debug!("rejecting join of {} ({}): {}", node, kind, reason);
            vec![(
                from,
                GossipMessage::JoinReject {
                    sender: local_id,
                    kind,
                    reason,
                },
            )]
        };

        if cluster != self.cluster_name {
            return reject(
                JoinRejectKind::Permanent,
                format!(
                    "cluster name mismatch: expected '{}', got '{}'",
                    self.cluster_name, cluster
                ),
            );
        }

        let local_up = self.status == MembershipStatus::Joined
            && self
                .gossip
                .member(&local_id)
                .is_some_and(|m| m.status() == GossipNodeStatus::Up);
        if !local_up {
            return reject(JoinRejectKind::Temporary, "not an UP member".into());
        }

        if self.gossip.removed().contains(&node.id) {
            return reject(
                JoinRejectKind::Permanent,
                "node was removed from the cluster".into(),
            );
        }

        let conflict = self.gossip.members().values().find(|m| {
            m.status().is_active() && m.id() != node.id && m.node().address == node.address
        });
        if let Some(owner) = conflict {
            return reject(
                JoinRejectKind::Conflict,
                format!("address {} is used by node {}", node.address, owner.id()),
            );
        }

        if !self.gossip.has_member(&node.id) {
            info!("node {} is joining through {}", node, self.local);
            let state = GossipNodeState::new(node.with_join_order(0), GossipNodeStatus::Joining);
            self.replace_gossip(self.gossip.update(&local_id, state));
        }

        vec![(
            from,
            GossipMessage::JoinAccept {
                sender: local_id,
                gossip: Arc::clone(&self.gossip),
            },
        )]
    }

    fn handle_join_accept(
        &mut self,
        sender: ClusterNodeId,
        gossip: Arc<Gossip>,
        from: SocketAddr,
    ) -> Outgoing {
        if self.status != MembershipStatus::Joining {
            return self.handle_update(sender, gossip, from);
        }
        let local_id = self.local.id;
        if !gossip.has_member(&local_id) {
            warn!("join accept from {} doesn't list {}, ignoring", from, self.local);
            return Vec::new();
        }

        info!("join request of {} accepted by {} ({})", self.local, sender, from);
        self.pending_join = None;
        self.status = MembershipStatus::Joined;
        let merged = self.gossip.merge(&local_id, &gossip);
        self.replace_gossip(merged);
        self.publish()
    }

    fn handle_join_reject(&mut self, kind: JoinRejectKind, reason: String, from: SocketAddr) {
        if self.status != MembershipStatus::Joining {
            return;
        }
        match kind {
            JoinRejectKind::Temporary => {
                debug!("seed {} rejected join for now: {}", from, reason);
                self.seeds.on_reject(from);
            }
            JoinRejectKind::Permanent | JoinRejectKind::Conflict => {
                warn!("seed {} rejected join ({}): {}", from, kind, reason);
                self.seeds.on_ban(from);
            }
        }
        if self.pending_join == Some(from) {
            self.pending_join = None;
        }
    }

    // -- membership --

    fn handle_update(
        &mut self,
        sender: ClusterNodeId,
        gossip: Arc<Gossip>,
        from: SocketAddr,
    ) -> Outgoing {
        if !self.is_member() {
            trace!("not a member yet, ignoring update from {}", sender);
            return Vec::new();
        }
        self.detector.on_heartbeat(&sender);

        let local_id = self.local.id;
        let merged = match self.gossip.compare(&gossip) {
            GossipPrecedence::Same => self.gossip.inherit_seen(&local_id, &gossip),
            precedence => {
                debug!("merging gossip from {} ({:?})", sender, precedence);
                self.gossip.merge(&local_id, &gossip)
            }
        };
        self.replace_gossip(merged);

        let mut out = self.publish();
        if self.status == MembershipStatus::Left {
            return out;
        }

        // answer unless the sender already knows everything we know
        let up_to_date = self.gossip.compare(&gossip) == GossipPrecedence::Same
            && self.gossip.seen().is_subset(gossip.seen());
        if !up_to_date {
            out.push((
                from,
                GossipMessage::Update {
                    sender: local_id,
                    gossip: Arc::clone(&self.gossip),
                },
            ));
        }
        out
    }

    fn member_round(&mut self) -> Outgoing {
        let local_id = self.local.id;

        let live = self.gossip.topology_nodes();
        self.detector.update_members(local_id, &live);
        self.detector.tick();
        self.refresh_local_suspicion();

        if self.gossip.is_convergent() && self.gossip.is_coordinator(&local_id) {
            self.coordinate();
        }

        let mut out = self.publish();
        if self.status == MembershipStatus::Left {
            return out;
        }

        let peers: Vec<SocketAddr> = self.peers();
        let fanout = self.config.fanout(self.gossip.members().len()).min(peers.len());
        for addr in peers.choose_multiple(&mut rand::rng(), fanout) {
            out.push((
                *addr,
                GossipMessage::Update {
                    sender: local_id,
                    gossip: Arc::clone(&self.gossip),
                },
            ));
        }

        for node in self.detector.heartbeat_targets() {
            out.push((node.address, GossipMessage::HeartbeatRequest { sender: local_id }));
        }
        out
    }

    /// Addresses of the other non-DOWN members.
    fn peers(&self) -> Vec<SocketAddr> {
        self.gossip
            .members()
            .values()
            .filter(|m| m.status().is_active() && m.id() != self.local.id)
            .map(|m| m.node().address)
            .collect()
    }

    fn refresh_local_suspicion(&mut self) {
        let local_id = self.local.id;
        let Some(local) = self.gossip.member(&local_id) else {
            return;
        };

        let suspected: BTreeSet<ClusterNodeId> = self
            .detector
            .suspected()
            .into_iter()
            .filter(|id| {
                *id != local_id
                    && self
                        .gossip
                        .member(id)
                        .is_some_and(|m| m.status().is_active())
            })
            .collect();
        if &suspected == local.suspected() {
            return;
        }

        for id in suspected.difference(local.suspected()) {
            info!("node {} suspects {}", self.local, id);
        }
        let updated = local.suspect(suspected).next_version();
        self.replace_gossip(self.gossip.update(&local_id, updated));
    }

    /// Makes at most one membership change. Only called on the coordinator
    /// of a convergent view.
    fn coordinate(&mut self) {
        let local_id = self.local.id;
        let gossip = Arc::clone(&self.gossip);

        let down: BTreeSet<ClusterNodeId> = gossip
            .members()
            .values()
            .filter(|m| m.status() == GossipNodeStatus::Down)
            .map(GossipNodeState::id)
            .collect();
        if !down.is_empty() {
            info!("purging down nodes {}", display_ids(&down));
            self.replace_gossip(gossip.purge(&local_id, &down));
            return;
        }

        let failed = self.confirmed_failures(&gossip);
        if !failed.is_empty() {
            let updates: Vec<GossipNodeState> = failed
                .iter()
                .filter_map(|id| gossip.member(id))
                .map(|m| {
                    info!("node {} failed, marking down", m.node());
                    m.with_status(GossipNodeStatus::Down).next_version()
                })
                .collect();
            self.replace_gossip(gossip.update_all(&local_id, updates));
            return;
        }

        let left: Vec<GossipNodeState> = gossip
            .members()
            .values()
            .filter(|m| m.status() == GossipNodeStatus::Leaving)
            .map(|m| {
                info!("node {} left, marking down", m.node());
                m.with_status(GossipNodeStatus::Down).next_version()
            })
            .collect();
        if !left.is_empty() {
            self.replace_gossip(gossip.update_all(&local_id, left));
            return;
        }

        let mut order = gossip.max_join_order();
        let joined: Vec<GossipNodeState> = gossip
            .members()
            .values()
            .filter(|m| m.status() == GossipNodeStatus::Joining)
            .map(|m| {
                order += 1;
                info!("node {} is up with join order {}", m.node(), order);
                m.with_status(GossipNodeStatus::Up)
                    .with_join_order(order)
                    .next_version()
            })
            .collect();
        if !joined.is_empty() {
            self.replace_gossip(gossip.update_all(&local_id, joined));
        }
    }

    /// Live nodes suspected by enough live, unsuspected members.
    fn confirmed_failures(&self, gossip: &Gossip) -> BTreeSet<ClusterNodeId> {
        let suspects = gossip.suspect_view();
        let live: Vec<ClusterNodeId> = gossip
            .members()
            .values()
            .filter(|m| m.status().is_active())
            .map(GossipNodeState::id)
            .collect();

        let quorum = self
            .detector
            .failure_quorum()
            .min(live.len().saturating_sub(1));
        if quorum == 0 {
            return BTreeSet::new();
        }

        let trusted: BTreeSet<ClusterNodeId> = live
            .iter()
            .filter(|id| !suspects.contains_key(id))
            .copied()
            .collect();

        suspects
            .into_iter()
            .filter(|(id, _)| *id != self.local.id && live.contains(id))
            .filter(|(_, by)| by.iter().filter(|s| trusted.contains(s)).count() >= quorum)
            .map(|(id, _)| id)
            .collect()
    }

    /// Recomputes the topology and emits the change, if any. When the local
    /// node turned out DOWN or purged, switches to `Left` and returns a last
    /// round of updates to every other member.
    fn publish(&mut self) -> Outgoing {
        let local_id = self.local.id;
        let next = ClusterTopology::new(local_id, self.gossip.topology_nodes());

        if let Some(event) = ClusterEvent::between(&self.topology, &next) {
            match event.kind {
                ClusterEventKind::Join => info!(
                    "{} joined cluster '{}': {}",
                    self.local, self.cluster_name, next
                ),
                ClusterEventKind::Change => info!(
                    "topology changed (+{} -{}): {}",
                    event.added.len(),
                    event.removed.len(),
                    next
                ),
                ClusterEventKind::Leave => {
                    info!("{} left cluster '{}'", self.local, self.cluster_name)
                }
            }
            self.emit(event);
        }
        self.topology = next;

        let active = self
            .gossip
            .member(&local_id)
            .is_some_and(|m| m.status().is_active());
        if !self.is_member() || active {
            return Vec::new();
        }

        if self.status == MembershipStatus::Joined {
            warn!("{} was removed from the cluster", self.local);
        }
        self.status = MembershipStatus::Left;

        self.peers()
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    GossipMessage::Update {
                        sender: local_id,
                        gossip: Arc::clone(&self.gossip),
                    },
                )
            })
            .collect()
    }

    /// Sends a cluster event to the external event channel.
    fn emit(&self, event: ClusterEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("cluster event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => trace!("cluster event channel closed"),
        }
    }
}

fn display_ids(ids: &BTreeSet<ClusterNodeId>) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
