//! Seed nodes used to bootstrap a join.
//!
//! A joining node dials configured seed addresses one at a time until some
//! member accepts it. [`GossipSeedNodesState`] remembers how each seed
//! answered and decides when nobody else is reachable and the node should
//! form a new cluster on its own.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::ClusterError;

/// Outcome of the last join attempt against a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedNodeStatus {
    /// Not tried yet.
    New,
    /// Reachable but rejected the join for now.
    Retry,
    /// Unreachable.
    Failed,
    /// Permanently excluded (e.g. belongs to another cluster).
    Ban,
}

/// A seed address and its dial status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedNodeState {
    pub address: SocketAddr,
    pub status: SeedNodeStatus,
}

/// Dial ordering and outcomes for bootstrap seeds.
///
/// Addresses are kept sorted by (host, port) so every node walks them in
/// the same order. The local address is always part of the list.
#[derive(Debug, Clone)]
pub struct GossipSeedNodesState {
    local_addr: SocketAddr,
    seeds: Vec<SeedNodeState>,
    last_tried: Option<SocketAddr>,
}

impl GossipSeedNodesState {
    /// Creates the state from configured seed addresses.
    pub fn new(local_addr: SocketAddr, seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut state = Self {
            local_addr,
            seeds: Vec::new(),
            last_tried: None,
        };
        state.update(seeds);
        state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// All seeds in dial order, including the local address.
    pub fn seeds(&self) -> &[SeedNodeState] {
        &self.seeds
    }

    /// Returns true if there is no seed other than the local address.
    pub fn is_empty(&self) -> bool {
        self.seeds.iter().all(|s| s.address == self.local_addr)
    }

    /// Status of a seed, if known.
    pub fn status(&self, addr: &SocketAddr) -> Option<SeedNodeStatus> {
        self.seeds
            .iter()
            .find(|s| s.address == *addr)
            .map(|s| s.status)
    }

    /// Replaces the seed list, keeping the status of addresses that remain.
    pub fn update(&mut self, addresses: impl IntoIterator<Item = SocketAddr>) {
        let mut next: Vec<SeedNodeState> = addresses
            .into_iter()
            .chain(std::iter::once(self.local_addr))
            .map(|address| SeedNodeState {
                address,
                status: self.status(&address).unwrap_or(SeedNodeStatus::New),
            })
            .collect();
        next.sort_by_key(|s| s.address);
        next.dedup_by_key(|s| s.address);
        self.seeds = next;
    }

    /// Picks the next seed to dial, skipping banned seeds and ourselves.
    ///
    /// Walks the sorted list from the last tried address and wraps around.
    pub fn next_seed(&mut self) -> Option<SocketAddr> {
        let candidates: Vec<SocketAddr> = self
            .seeds
            .iter()
            .filter(|s| s.address != self.local_addr && s.status != SeedNodeStatus::Ban)
            .map(|s| s.address)
            .collect();

        let next = match self.last_tried {
            Some(last) => candidates
                .iter()
                .find(|addr| **addr > last)
                .or_else(|| candidates.first())
                .copied(),
            None => candidates.first().copied(),
        };

        if next.is_some() {
            self.last_tried = next;
        }
        next
    }

    /// Decides whether the local node should form a new cluster alone.
    ///
    /// Never while some other seed is still untried. After that, only if the
    /// local address sorts first among seeds that are neither failed nor
    /// banned: when two nodes see each other but can't join, the one with
    /// the lower address forms the cluster and the other keeps retrying.
    pub fn is_self_join(&self) -> bool {
        let untried = self
            .seeds
            .iter()
            .any(|s| s.address != self.local_addr && s.status == SeedNodeStatus::New);
        if untried {
            return false;
        }

        self.seeds
            .iter()
            .find(|s| {
                s.address == self.local_addr
                    || !matches!(s.status, SeedNodeStatus::Failed | SeedNodeStatus::Ban)
            })
            .is_some_and(|s| s.address == self.local_addr)
    }

    /// The seed is alive but rejected the join.
    pub fn on_reject(&mut self, addr: SocketAddr) {
        self.set_status(addr, SeedNodeStatus::Retry);
    }

    /// The seed could not be reached.
    pub fn on_failure(&mut self, addr: SocketAddr) {
        self.set_status(addr, SeedNodeStatus::Failed);
    }

    /// The seed must never be tried again.
    pub fn on_ban(&mut self, addr: SocketAddr) {
        self.set_status(addr, SeedNodeStatus::Ban);
    }

    fn set_status(&mut self, addr: SocketAddr, status: SeedNodeStatus) {
        if addr == self.local_addr {
            return;
        }
        if let Some(seed) = self.seeds.iter_mut().find(|s| s.address == addr) {
            debug!("seed {} status {:?} -> {:?}", addr, seed.status, status);
            seed.status = status;
        }
    }
}

/// Source of seed addresses for joining a cluster.
///
/// Backends (static lists, shared filesystems, service registries) live
/// outside this crate; gossip only needs these four operations.
pub trait SeedNodeProvider: Send + Sync {
    /// Returns the seed addresses currently registered for `cluster`.
    fn seed_nodes(&self, cluster: &str) -> Result<Vec<SocketAddr>, ClusterError>;

    /// Advertises the local address once the node has joined.
    fn register_address(&self, cluster: &str, addr: SocketAddr) -> Result<(), ClusterError>;

    /// Withdraws the local address when the node leaves.
    fn unregister_address(&self, cluster: &str, addr: SocketAddr) -> Result<(), ClusterError>;

    /// How often seed addresses are reloaded while joining. `None` keeps
    /// the configured `seed_cleanup_interval_ms`.
    fn cleanup_interval(&self) -> Option<Duration>;
}

/// Seed provider backed by a fixed address list.
#[derive(Debug, Clone, Default)]
pub struct StaticSeedNodeProvider {
    addresses: Vec<SocketAddr>,
}

impl StaticSeedNodeProvider {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    /// Parses `host:port` strings.
    pub fn parse<S: AsRef<str>>(addresses: &[S]) -> Result<Self, ClusterError> {
        let addresses = addresses
            .iter()
            .map(|a| {
                a.as_ref()
                    .parse::<SocketAddr>()
                    .map_err(|e| ClusterError::InvalidAddress(format!("{}: {e}", a.as_ref())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { addresses })
    }
}

impl SeedNodeProvider for StaticSeedNodeProvider {
    fn seed_nodes(&self, _cluster: &str) -> Result<Vec<SocketAddr>, ClusterError> {
        Ok(self.addresses.clone())
    }

    fn register_address(&self, _cluster: &str, _addr: SocketAddr) -> Result<(), ClusterError> {
        Ok(())
    }

    fn unregister_address(&self, _cluster: &str, _addr: SocketAddr) -> Result<(), ClusterError> {
        Ok(())
    }

    fn cleanup_interval(&self) -> Option<Duration> {
        None
    }
}
