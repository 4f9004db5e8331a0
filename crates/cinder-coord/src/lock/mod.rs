//! Distributed locks.
//!
//! Locks live in regions. Each lock name maps to one lock manager through
//! the [`PartitionMapper`](cinder_cluster::PartitionMapper); the manager
//! itself is reached through a [`LockChannel`] and is not part of this
//! crate.

mod channel;
mod client;
mod protocol;
mod region;

pub use channel::{LockChannel, RetryPolicy};
pub use client::{
    Dispatch, LockClientStatus, LockControllerClient, LockFuture, LockReplyAction, OwnerUpdate,
};
pub use protocol::{
    LockOwner, LockOwnerRequest, LockOwnerResponse, LockOwnerResponseStatus, LockProtocol,
    LockProtocolReply, LockRequest, LockResponse, LockResponseStatus, UnlockRequest,
    UnlockResponse, UnlockResponseStatus,
};
pub use region::{AsyncLockCallback, ClusterLock, DistributedLock, LockRegion};
