//! cinder-cluster: gossip-based cluster membership.
//!
//! Nodes find each other through seed addresses, exchange their view of the
//! cluster with a few random peers every round, and agree on membership
//! changes without a consensus round: the coordinator, a pure function of
//! the gossip view, makes each change once everybody has seen the previous
//! one.
//!
//! # Architecture
//!
//! - **Gossip values**: immutable [`Gossip`] views with a commutative,
//!   idempotent merge
//! - **Seed nodes**: bootstrap dialing and the self-join decision
//! - **Failure detection**: heartbeats to ring neighbours, suspicions
//!   gossiped and confirmed by a quorum
//! - **Manager**: the sans-IO protocol state machine
//! - **Driver**: the tokio task running a manager over message channels
//! - **Topology**: member snapshots, change events and key partitioning
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cinder_cluster::{ClusterConfig, ClusterNode, ClusterNodeId, GossipDriver};
//!
//! let node = ClusterNode::new(ClusterNodeId::new(), "127.0.0.1:7000".parse()?);
//! let handle = GossipDriver::new(node, ClusterConfig::default()).spawn(inbound, outbound)?;
//! let topology = handle.await_joined().await?;
//! println!("joined {topology}");
//! ```

mod config;
mod driver;
mod error;
mod failure;
mod gossip;
mod manager;
mod message;
mod node;
mod partition;
mod seeds;
mod topology;

pub use config::{ClusterConfig, FailureDetectorConfig, GossipConfig};
pub use driver::{GossipDriver, GossipHandle};
pub use error::ClusterError;
pub use failure::{DefaultFailureDetector, FailureDetector};
pub use gossip::{Gossip, GossipNodeState, GossipNodeStatus, GossipPrecedence};
pub use manager::{GossipManager, MembershipStatus, Outgoing};
pub use message::{Envelope, GossipMessage, JoinRejectKind};
pub use node::{ClusterNode, ClusterNodeId};
pub use partition::{
    crc16, PartitionMapper, PartitionMapping, RendezvousPartitionMapper, DEFAULT_PARTITIONS,
};
pub use seeds::{
    GossipSeedNodesState, SeedNodeProvider, SeedNodeState, SeedNodeStatus, StaticSeedNodeProvider,
};
pub use topology::{ClusterEvent, ClusterEventKind, ClusterHash, ClusterTopology};
