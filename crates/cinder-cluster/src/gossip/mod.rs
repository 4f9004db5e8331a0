//! Cluster membership gossip state.
//!
//! [`Gossip`] is an immutable value holding every known member, the
//! tombstones of purged members and the set of nodes that have seen the
//! current membership view. Nodes exchange it periodically and combine
//! views with [`Gossip::merge`], which is a join over member versions and
//! tombstones: merging in any order, any number of times, across any
//! subset of peers converges to the same members and tombstones.
//!
//! Member status transitions are decided by the gossip manager; this type
//! only aggregates and disseminates them.

mod node_state;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::{ClusterNode, ClusterNodeId};

pub use node_state::{GossipNodeState, GossipNodeStatus};

/// Result of comparing two gossip values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipPrecedence {
    /// This value is older: the other one knows everything we know and more.
    Before,
    /// This value is newer: we know everything the other one knows and more.
    After,
    /// Both values carry the same members and tombstones.
    Same,
    /// Each side knows something the other doesn't.
    Concurrent,
}

/// Immutable membership view.
#[derive(Debug, Clone, Default)]
pub struct Gossip {
    version: u64,
    members: BTreeMap<ClusterNodeId, GossipNodeState>,
    removed: BTreeSet<ClusterNodeId>,
    seen: BTreeSet<ClusterNodeId>,
    max_join_order: u32,
    /// Computed on first use. Never invalidated: every change builds a new value.
    convergence: OnceLock<bool>,
}

impl PartialEq for Gossip {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.members == other.members
            && self.removed == other.removed
            && self.seen == other.seen
            && self.max_join_order == other.max_join_order
    }
}

impl Eq for Gossip {}

impl Gossip {
    /// Creates an empty gossip value.
    pub fn new() -> Self {
        Self::default()
    }

    fn build(
        version: u64,
        mut members: BTreeMap<ClusterNodeId, GossipNodeState>,
        removed: BTreeSet<ClusterNodeId>,
        mut seen: BTreeSet<ClusterNodeId>,
        max_join_order: u32,
    ) -> Self {
        // Suspicions of purged nodes are dropped from every record at its
        // current version, so all views holding the same tombstones agree.
        for state in members.values_mut() {
            if state.suspected().iter().any(|id| removed.contains(id)) {
                *state = state.unsuspected(&removed);
            }
        }
        seen.retain(|id| members.contains_key(id));
        let max_join_order = members
            .values()
            .map(GossipNodeState::join_order)
            .fold(max_join_order, u32::max);
        debug_assert!(members.keys().all(|id| !removed.contains(id)));
        Self {
            version,
            members,
            removed,
            seen,
            max_join_order,
            convergence: OnceLock::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn max_join_order(&self) -> u32 {
        self.max_join_order
    }

    pub fn members(&self) -> &BTreeMap<ClusterNodeId, GossipNodeState> {
        &self.members
    }

    pub fn member(&self, id: &ClusterNodeId) -> Option<&GossipNodeState> {
        self.members.get(id)
    }

    pub fn has_member(&self, id: &ClusterNodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn removed(&self) -> &BTreeSet<ClusterNodeId> {
        &self.removed
    }

    pub fn seen(&self) -> &BTreeSet<ClusterNodeId> {
        &self.seen
    }

    pub fn is_seen(&self, id: &ClusterNodeId) -> bool {
        self.seen.contains(id)
    }

    /// Returns true if every id in `ids` has seen this view.
    pub fn has_seen<'a>(&self, ids: impl IntoIterator<Item = &'a ClusterNodeId>) -> bool {
        ids.into_iter().all(|id| self.seen.contains(id))
    }

    /// Returns true if the node is down or was purged.
    pub fn is_down_or_removed(&self, id: &ClusterNodeId) -> bool {
        self.removed.contains(id)
            || self
                .members
                .get(id)
                .is_some_and(|m| m.status() == GossipNodeStatus::Down)
    }

    /// Ids of the members that currently suspect `id`.
    pub fn suspected_by(&self, id: &ClusterNodeId) -> BTreeSet<ClusterNodeId> {
        self.members
            .values()
            .filter(|m| m.is_suspected(id))
            .map(GossipNodeState::id)
            .collect()
    }

    /// Every suspicion currently reported, keyed by the suspected node.
    pub fn suspect_view(&self) -> BTreeMap<ClusterNodeId, BTreeSet<ClusterNodeId>> {
        let mut view: BTreeMap<ClusterNodeId, BTreeSet<ClusterNodeId>> = BTreeMap::new();
        for member in self.members.values() {
            for suspected in member.suspected() {
                view.entry(*suspected).or_default().insert(member.id());
            }
        }
        view
    }

    /// Non-DOWN members ordered by seniority.
    pub fn topology_nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self
            .members
            .values()
            .filter(|m| m.status().is_active())
            .map(|m| m.node().clone())
            .collect();
        nodes.sort_by(|a, b| a.seniority_cmp(b));
        nodes
    }

    /// Returns true once every member has seen this view, is DOWN, or is
    /// suspected by some member.
    ///
    /// Failed nodes can't acknowledge anything, so a pending suspicion must
    /// not block progress; the coordinator turns confirmed suspicions into
    /// DOWN transitions.
    pub fn is_convergent(&self) -> bool {
        *self.convergence.get_or_init(|| {
            let suspected: BTreeSet<ClusterNodeId> = self
                .members
                .values()
                .flat_map(|m| m.suspected().iter().copied())
                .collect();

            self.members.values().all(|m| {
                self.seen.contains(&m.id())
                    || m.status() == GossipNodeStatus::Down
                    || suspected.contains(&m.id())
            })
        })
    }

    /// Selects the coordinator as seen from `local_id`.
    ///
    /// Candidates are non-DOWN members that the local member doesn't
    /// suspect; the most senior one wins. This is a pure function of the
    /// members, so nodes with the same view agree without exchanging votes.
    pub fn coordinator(&self, local_id: &ClusterNodeId) -> Option<&ClusterNode> {
        let local_suspected = self.members.get(local_id).map(GossipNodeState::suspected);

        self.members
            .values()
            .filter(|m| m.status().is_active())
            .filter(|m| local_suspected.is_none_or(|s| !s.contains(&m.id())))
            .map(GossipNodeState::node)
            .min_by(|a, b| a.seniority_cmp(b))
    }

    /// Returns true if `local_id` is the coordinator of this view.
    pub fn is_coordinator(&self, local_id: &ClusterNodeId) -> bool {
        self.coordinator(local_id).is_some_and(|n| n.id == *local_id)
    }

    /// Compares member versions and tombstones with another view.
    pub fn compare(&self, other: &Gossip) -> GossipPrecedence {
        let mut ahead = false;
        let mut behind = false;

        if !self.removed.is_subset(&other.removed) {
            ahead = true;
        }
        if !other.removed.is_subset(&self.removed) {
            behind = true;
        }

        for (id, mine) in &self.members {
            match other.members.get(id) {
                Some(theirs) => match mine.version().cmp(&theirs.version()) {
                    Ordering::Greater => ahead = true,
                    Ordering::Less => behind = true,
                    Ordering::Equal => {
                        if mine != theirs {
                            ahead = true;
                            behind = true;
                        }
                    }
                },
                // purged on their side: already counted through tombstones
                None if other.removed.contains(id) => {}
                None => ahead = true,
            }
        }
        for id in other.members.keys() {
            if !self.members.contains_key(id) && !self.removed.contains(id) {
                behind = true;
            }
        }

        match (ahead, behind) {
            (false, false) => GossipPrecedence::Same,
            (true, false) => GossipPrecedence::After,
            (false, true) => GossipPrecedence::Before,
            (true, true) => GossipPrecedence::Concurrent,
        }
    }

    /// Merges another view into this one on behalf of `local_id`.
    pub fn merge(&self, local_id: &ClusterNodeId, other: &Gossip) -> Gossip {
        let removed: BTreeSet<ClusterNodeId> = self.removed.union(&other.removed).copied().collect();

        let mut members = BTreeMap::new();
        for (id, state) in self.members.iter().chain(other.members.iter()) {
            if removed.contains(id) || members.contains_key(id) {
                continue;
            }
            let merged = match (self.members.get(id), other.members.get(id)) {
                (Some(a), Some(b)) => a.merge(b),
                _ => state.clone(),
            };
            members.insert(*id, merged);
        }

        let mut seen = BTreeSet::new();
        if members == self.members {
            seen.extend(self.seen.iter().copied());
        }
        if members == other.members {
            seen.extend(other.seen.iter().copied());
        }
        seen.insert(*local_id);

        Gossip::build(
            self.version.max(other.version),
            members,
            removed,
            seen,
            self.max_join_order.max(other.max_join_order),
        )
    }

    /// Replaces the record of one member if `state` is newer (or new).
    ///
    /// Any change resets `seen` to the local node only.
    pub fn update(&self, local_id: &ClusterNodeId, state: GossipNodeState) -> Gossip {
        self.update_all(local_id, std::iter::once(state))
    }

    /// Applies several member records at once.
    pub fn update_all(
        &self,
        local_id: &ClusterNodeId,
        states: impl IntoIterator<Item = GossipNodeState>,
    ) -> Gossip {
        let mut members = self.members.clone();
        let mut changed = false;

        for state in states {
            if self.removed.contains(&state.id()) {
                continue;
            }
            let merged = match members.get(&state.id()) {
                Some(existing) => existing.merge(&state),
                None => state,
            };
            let merged = if merged.suspected().iter().any(|id| self.removed.contains(id)) {
                merged.unsuspected(&self.removed)
            } else {
                merged
            };
            if members.get(&merged.id()) != Some(&merged) {
                members.insert(merged.id(), merged);
                changed = true;
            }
        }

        if !changed {
            return self.mark_seen(local_id);
        }

        Gossip::build(
            self.version,
            members,
            self.removed.clone(),
            BTreeSet::from([*local_id]),
            self.max_join_order,
        )
    }

    /// Marks the current view as seen by `local_id`.
    pub fn mark_seen(&self, local_id: &ClusterNodeId) -> Gossip {
        if self.seen.contains(local_id) || !self.members.contains_key(local_id) {
            return self.clone();
        }
        let mut seen = self.seen.clone();
        seen.insert(*local_id);
        Gossip::build(
            self.version,
            self.members.clone(),
            self.removed.clone(),
            seen,
            self.max_join_order,
        )
    }

    /// Marks the view as seen by every id in `ids`.
    pub fn seen_all<'a>(&self, ids: impl IntoIterator<Item = &'a ClusterNodeId>) -> Gossip {
        let mut seen = self.seen.clone();
        seen.extend(ids);
        if seen == self.seen {
            return self.clone();
        }
        Gossip::build(
            self.version,
            self.members.clone(),
            self.removed.clone(),
            seen,
            self.max_join_order,
        )
    }

    /// Takes the `seen` set of another value carrying the same members.
    ///
    /// Used when a peer echoes our view back: both sides have then seen it.
    pub fn inherit_seen(&self, local_id: &ClusterNodeId, other: &Gossip) -> Gossip {
        if self.members != other.members || self.removed != other.removed {
            return self.mark_seen(local_id);
        }
        let mut seen: BTreeSet<ClusterNodeId> = self.seen.union(&other.seen).copied().collect();
        seen.insert(*local_id);
        Gossip::build(
            self.version.max(other.version),
            self.members.clone(),
            self.removed.clone(),
            seen,
            self.max_join_order.max(other.max_join_order),
        )
    }

    /// Permanently forgets `ids`.
    ///
    /// Called by the coordinator once convergence shows the DOWN status of
    /// these members has been seen by everybody.
    ///
    /// # Panics
    ///
    /// Panics if `ids` is empty.
    pub fn purge(&self, local_id: &ClusterNodeId, ids: &BTreeSet<ClusterNodeId>) -> Gossip {
        assert!(!ids.is_empty(), "purge requires at least one node");

        let mut members = self.members.clone();
        for id in ids {
            members.remove(id);
        }

        let mut removed = self.removed.clone();
        removed.extend(ids.iter().copied());

        Gossip::build(
            self.version + 1,
            members,
            removed,
            BTreeSet::from([*local_id]),
            self.max_join_order,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use rand::seq::IndexedRandom;
    use rand::Rng;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn node_state(port: u16, status: GossipNodeStatus) -> GossipNodeState {
        GossipNodeState::new(ClusterNode::new(ClusterNodeId::new(), test_addr(port)), status)
    }

    fn gossip_of(local: &ClusterNodeId, states: &[GossipNodeState]) -> Gossip {
        Gossip::new().update_all(local, states.iter().cloned())
    }

    #[test]
    fn merge_adds_unknown_member() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let c = node_state(7003, GossipNodeStatus::Joining);

        let on_a = gossip_of(&a.id(), &[a.clone(), b.clone()]);
        let on_b = gossip_of(&b.id(), &[a.clone(), b.clone(), c.clone()]).with_version(3);

        let merged = on_a.merge(&a.id(), &on_b);
        assert_eq!(merged.members().len(), 3);
        assert!(merged.has_member(&c.id()));
        assert_eq!(merged.version(), on_a.version().max(on_b.version()));
        assert_eq!(merged.version(), 3);
    }

    impl Gossip {
        /// Test helper: same content with a different top-level version.
        fn with_version(&self, version: u64) -> Gossip {
            Gossip::build(
                version,
                self.members.clone(),
                self.removed.clone(),
                self.seen.clone(),
                self.max_join_order,
            )
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Joining);
        let g = gossip_of(&a.id(), &[a.clone(), b]);

        assert_eq!(g.merge(&a.id(), &g), g);
    }

    #[test]
    fn merge_keeps_local_seen_and_drops_stale_seen() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);

        let on_a = gossip_of(&a.id(), &[a.clone(), b.clone()]);
        let newer_b = b.with_status(GossipNodeStatus::Leaving).next_version();
        let on_b = on_a.merge(&b.id(), &on_a).update(&b.id(), newer_b);

        let merged = on_a.merge(&a.id(), &on_b);
        // b's view won, so b's seen set carries over, plus us
        assert!(merged.is_seen(&a.id()));
        assert!(merged.is_seen(&b.id()));

        let c = node_state(7003, GossipNodeStatus::Joining);
        let on_c = gossip_of(&c.id(), &[a.clone(), c.clone()]);
        let merged = on_a.merge(&a.id(), &on_c);
        // neither side's view survived unchanged
        assert_eq!(merged.seen().len(), 1);
        assert!(merged.is_seen(&a.id()));
    }

    #[test]
    fn tombstones_are_permanent() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Down);

        let before = gossip_of(&a.id(), &[a.clone(), b.clone()]);
        let purged = before.purge(&a.id(), &BTreeSet::from([b.id()]));
        assert!(!purged.has_member(&b.id()));
        assert!(purged.removed().contains(&b.id()));

        // a stale peer still knows b as UP
        let stale = gossip_of(&a.id(), &[a.clone(), b.with_status(GossipNodeStatus::Up).next_version()]);
        for merged in [purged.merge(&a.id(), &stale), stale.merge(&a.id(), &purged)] {
            assert!(!merged.has_member(&b.id()));
            assert!(merged.removed().contains(&b.id()));
        }

        // updates about a removed node are ignored
        let updated = purged.update(&a.id(), b.next_version().next_version());
        assert!(!updated.has_member(&b.id()));
    }

    #[test]
    fn merge_drops_suspicion_of_removed_members() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Down);
        let a_suspects = a.suspect([b.id()].into()).next_version();

        let on_a = gossip_of(&a.id(), &[a_suspects, b.clone()]);
        let on_coord = gossip_of(&a.id(), &[a.clone(), b.clone()]).purge(&a.id(), &BTreeSet::from([b.id()]));

        let merged = on_a.merge(&a.id(), &on_coord);
        assert!(!merged.member(&a.id()).unwrap().has_suspected());
    }

    #[test]
    fn purge_clears_suspicions_on_every_view() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let x = node_state(7003, GossipNodeStatus::Down);
        let a_suspects = a.suspect([x.id()].into()).next_version();
        let all = [a_suspects.clone(), b.clone(), x.clone()];

        // b coordinates and purges x while a's record still suspects it
        let on_b = gossip_of(&b.id(), &all).purge(&b.id(), &BTreeSet::from([x.id()]));
        let on_a = gossip_of(&a.id(), &all);

        let record = on_b.member(&a.id()).unwrap();
        assert!(!record.has_suspected());
        assert_eq!(record.version(), a_suspects.version());

        // both sides end with identical member records, so the exchange stops
        let merged_on_a = on_a.merge(&a.id(), &on_b);
        let merged_on_b = on_b.merge(&b.id(), &merged_on_a);
        assert_eq!(merged_on_a.members(), merged_on_b.members());
        assert_eq!(merged_on_a.compare(&merged_on_b), GossipPrecedence::Same);
        assert_eq!(on_b.compare(&merged_on_a), GossipPrecedence::Same);

        // a stale record that still suspects x is normalized on arrival
        let replayed = merged_on_b.update(&b.id(), a_suspects);
        assert!(!replayed.member(&a.id()).unwrap().has_suspected());
    }

    #[test]
    #[should_panic(expected = "at least one node")]
    fn purge_of_empty_set_rejected() {
        let a = node_state(7001, GossipNodeStatus::Up);
        gossip_of(&a.id(), &[a.clone()]).purge(&a.id(), &BTreeSet::new());
    }

    #[test]
    fn purge_bumps_version_and_resets_seen() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let c = node_state(7003, GossipNodeStatus::Down);
        let g = gossip_of(&a.id(), &[a.clone(), b.clone(), c.clone()]).seen_all(&[b.id()]);

        let purged = g.purge(&a.id(), &BTreeSet::from([c.id()]));
        assert_eq!(purged.version(), g.version() + 1);
        assert_eq!(purged.seen(), &BTreeSet::from([a.id()]));
    }

    #[test]
    fn convergence_requires_all_seen() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let g = gossip_of(&a.id(), &[a.clone(), b.clone()]);
        assert!(!g.is_convergent());

        let g = g.seen_all(&[b.id()]);
        assert!(g.is_convergent());

        // merging an identical view keeps it convergent
        let echoed = g.merge(&b.id(), &g);
        assert!(g.merge(&a.id(), &echoed).is_convergent());
    }

    #[test]
    fn convergence_tolerates_down_and_suspected() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let c = node_state(7003, GossipNodeStatus::Down);

        let g = gossip_of(&a.id(), &[a.clone(), b.clone(), c]);
        assert!(!g.is_convergent());

        let a_suspects_b = a.suspect([b.id()].into()).next_version();
        let g = g.update(&a.id(), a_suspects_b);
        assert!(g.is_convergent());
    }

    #[test]
    fn coordinator_is_most_senior_active_member() {
        let a = node_state(7001, GossipNodeStatus::Up).with_join_order(2);
        let b = node_state(7002, GossipNodeStatus::Up).with_join_order(1);
        let c = node_state(7003, GossipNodeStatus::Joining);
        let g = gossip_of(&a.id(), &[a.clone(), b.clone(), c.clone()]);

        assert_eq!(g.coordinator(&a.id()).map(|n| n.id), Some(b.id()));
        assert!(g.is_coordinator(&b.id()));

        // b goes down: a takes over
        let g = g.update(&a.id(), b.with_status(GossipNodeStatus::Down).next_version());
        assert_eq!(g.coordinator(&a.id()).map(|n| n.id), Some(a.id()));
    }

    #[test]
    fn coordinator_skips_nodes_suspected_locally() {
        let a = node_state(7001, GossipNodeStatus::Up).with_join_order(2);
        let b = node_state(7002, GossipNodeStatus::Up).with_join_order(1);
        let a_suspects_b = a.suspect([b.id()].into()).next_version();
        let g = gossip_of(&a.id(), &[a_suspects_b, b.clone()]);

        assert_eq!(g.coordinator(&a.id()).map(|n| n.id), Some(a.id()));
        // b doesn't suspect itself, so from b's perspective it still leads
        assert_eq!(g.coordinator(&b.id()).map(|n| n.id), Some(b.id()));
    }

    #[test]
    fn coordinator_is_independent_of_construction_order() {
        let states: Vec<GossipNodeState> = (0..6)
            .map(|i| node_state(7000 + i, GossipNodeStatus::Up))
            .collect();
        let local = states[0].id();

        let forward = gossip_of(&local, &states);
        let mut reversed = states.clone();
        reversed.reverse();
        let backward = gossip_of(&local, &reversed);

        assert_eq!(forward.members(), backward.members());
        assert_eq!(
            forward.coordinator(&local).map(|n| n.id),
            backward.coordinator(&local).map(|n| n.id)
        );
    }

    #[test]
    fn compare_detects_precedence() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let base = gossip_of(&a.id(), &[a.clone(), b.clone()]);

        assert_eq!(base.compare(&base), GossipPrecedence::Same);

        let newer = base.update(&a.id(), a.with_status(GossipNodeStatus::Leaving).next_version());
        assert_eq!(base.compare(&newer), GossipPrecedence::Before);
        assert_eq!(newer.compare(&base), GossipPrecedence::After);

        let other = base.update(&b.id(), b.with_status(GossipNodeStatus::Leaving).next_version());
        assert_eq!(newer.compare(&other), GossipPrecedence::Concurrent);

        let merged = newer.merge(&a.id(), &other);
        assert_eq!(merged.compare(&newer), GossipPrecedence::After);
        assert_eq!(merged.compare(&other), GossipPrecedence::After);
    }

    #[test]
    fn compare_accounts_for_tombstones() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Down);
        let base = gossip_of(&a.id(), &[a.clone(), b.clone()]);
        let purged = base.purge(&a.id(), &BTreeSet::from([b.id()]));

        assert_eq!(purged.compare(&base), GossipPrecedence::After);
        assert_eq!(base.compare(&purged), GossipPrecedence::Before);
    }

    #[test]
    fn inherit_seen_unions_matching_views() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let on_a = gossip_of(&a.id(), &[a.clone(), b.clone()]);
        let on_b = on_a.merge(&b.id(), &on_a);

        let inherited = on_a.inherit_seen(&a.id(), &on_b);
        assert!(inherited.has_seen(&[a.id(), b.id()]));
        assert!(inherited.is_convergent());
    }

    #[test]
    fn suspect_view_groups_by_target() {
        let a = node_state(7001, GossipNodeStatus::Up);
        let b = node_state(7002, GossipNodeStatus::Up);
        let c = node_state(7003, GossipNodeStatus::Up);
        let g = gossip_of(
            &a.id(),
            &[
                a.suspect([c.id()].into()).next_version(),
                b.suspect([c.id()].into()).next_version(),
                c.clone(),
            ],
        );

        let view = g.suspect_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[&c.id()], BTreeSet::from([a.id(), b.id()]));
        assert_eq!(g.suspected_by(&c.id()), BTreeSet::from([a.id(), b.id()]));
    }

    #[test]
    fn topology_nodes_exclude_down_members() {
        let a = node_state(7001, GossipNodeStatus::Up).with_join_order(1);
        let b = node_state(7002, GossipNodeStatus::Down).with_join_order(2);
        let c = node_state(7003, GossipNodeStatus::Joining);
        let g = gossip_of(&a.id(), &[a.clone(), b.clone(), c.clone()]);

        let ids: Vec<_> = g.topology_nodes().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![a.id(), c.id()]);
        assert!(g.is_down_or_removed(&b.id()));
        assert_eq!(g.max_join_order(), 2);
    }

    /// Random views of one shared node population, each knowing a random
    /// subset of members at random versions, some with tombstones.
    fn random_views(count: usize) -> (ClusterNodeId, Vec<Gossip>) {
        let mut rng = rand::rng();
        let population: Vec<GossipNodeState> = (0..8)
            .map(|i| node_state(7100 + i, GossipNodeStatus::Joining))
            .collect();
        let local = population[0].id();

        let views = (0..count)
            .map(|_| {
                let mut states = Vec::new();
                for base in population.iter().skip(1) {
                    if rng.random_bool(0.7) {
                        let mut s = base.clone();
                        for _ in 0..rng.random_range(0..4) {
                            s = s.next_version();
                        }
                        let status = *[
                            GossipNodeStatus::Joining,
                            GossipNodeStatus::Up,
                            GossipNodeStatus::Leaving,
                            GossipNodeStatus::Down,
                        ]
                        .choose(&mut rng)
                        .unwrap();
                        states.push(s.with_status(status));
                    }
                }
                states.push(population[0].clone());
                let mut g = gossip_of(&local, &states);
                let down: BTreeSet<ClusterNodeId> = g
                    .members()
                    .values()
                    .filter(|m| m.status() == GossipNodeStatus::Down && rng.random_bool(0.3))
                    .map(GossipNodeState::id)
                    .collect();
                if !down.is_empty() {
                    g = g.purge(&local, &down);
                }
                g
            })
            .collect();
        (local, views)
    }

    #[test]
    fn merge_is_order_independent() {
        for _ in 0..200 {
            let (local, views) = random_views(3);
            let (a, b, c) = (&views[0], &views[1], &views[2]);

            let left = a.merge(&local, b).merge(&local, c);
            let right = a.merge(&local, &b.merge(&local, c));
            let swapped = c.merge(&local, a).merge(&local, b);

            assert_eq!(left.members(), right.members());
            assert_eq!(left.removed(), right.removed());
            assert_eq!(left.members(), swapped.members());
            assert_eq!(left.removed(), swapped.removed());
            assert_eq!(left.version(), swapped.version());
        }
    }

    #[test]
    fn merge_with_self_is_identity_for_random_views() {
        for _ in 0..100 {
            let (local, views) = random_views(1);
            let g = views[0].mark_seen(&local);
            assert_eq!(g.merge(&local, &g), g);
        }
    }
}
