//! cinder-coord: distributed locks and leader election for cinder clusters.
//!
//! Locks are grouped into [`LockRegion`]s. Every lock name is owned by one
//! lock manager picked from the cluster topology; clients talk to it through
//! a [`LockChannel`] and drop any reply computed under a topology they have
//! already moved past.
//!
//! Leader election runs on top of a lock: the node holding a group's lock
//! leads, and everybody else follows the owner the lock manager reports.
//!
//! ```rust,ignore
//! use cinder_coord::{CoordConfig, ElectionWorker, LockRegion};
//!
//! let config = CoordConfig::from_file("coord.toml")?;
//! let region = LockRegion::for_elections(local.id, channel, mapper, &config);
//! region.follow(gossip.subscribe());
//! let election = ElectionWorker::spawn("scheduler", local, candidate, Arc::new(region.get("scheduler")));
//! println!("leader is {}", election.leader().await?);
//! ```

mod config;
mod error;

pub mod election;
pub mod lock;

pub use config::{CoordConfig, ElectionConfig, LockConfig};
pub use election::{
    Candidate, CandidateHandler, ElectionEvent, ElectionHandle, ElectionWorker, FollowerContext,
    LeaderChangeListener, LeaderContext, LeaderFuture,
};
pub use error::CoordError;
pub use lock::{
    AsyncLockCallback, ClusterLock, DistributedLock, LockChannel, LockClientStatus,
    LockControllerClient, LockFuture, LockOwner, LockRegion, RetryPolicy,
};
