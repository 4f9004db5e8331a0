//! Messages exchanged between lock clients and lock managers.
//!
//! Every reply carries the hash of the topology the manager computed it
//! under. Clients compare it with their own cached topology and discard
//! replies built against a view they have already moved past.

use std::time::Duration;

use cinder_cluster::{ClusterHash, ClusterNode, ClusterNodeId};

/// Node and logical thread currently holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub node: ClusterNode,
    pub thread_id: u64,
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node.id, self.thread_id)
    }
}

/// Asks the manager for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub lock_id: u64,
    pub region: String,
    pub name: String,
    pub node: ClusterNodeId,
    pub thread_id: u64,
    /// How long the manager may queue the request. `None` waits forever,
    /// zero fails immediately when the lock is held.
    pub timeout: Option<Duration>,
    /// Stream `LockBusy` and `LockOwnerChange` updates while queued.
    pub with_feedback: bool,
    pub topology: ClusterHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResponseStatus {
    /// The lock was granted.
    Ok,
    /// The manager can't decide under this topology. Ask again.
    Retry,
    /// The request timed out while queued.
    LockTimeout,
    /// The lock is held by somebody else.
    LockBusy,
    /// The lock moved to a new owner while this request waits.
    LockOwnerChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResponse {
    pub status: LockResponseStatus,
    pub owner: Option<LockOwner>,
    pub topology: ClusterHash,
}

impl LockResponse {
    /// True for replies after which no more updates follow.
    pub fn is_final(&self, with_feedback: bool) -> bool {
        match self.status {
            LockResponseStatus::Ok | LockResponseStatus::LockTimeout | LockResponseStatus::Retry => {
                true
            }
            LockResponseStatus::LockBusy | LockResponseStatus::LockOwnerChange => !with_feedback,
        }
    }
}

/// Releases a lock held by `node`/`thread_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockRequest {
    pub lock_id: u64,
    pub region: String,
    pub name: String,
    pub node: ClusterNodeId,
    pub thread_id: u64,
    pub topology: ClusterHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockResponseStatus {
    Ok,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockResponse {
    pub status: UnlockResponseStatus,
    pub topology: ClusterHash,
}

/// Asks the manager who currently owns a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwnerRequest {
    pub region: String,
    pub name: String,
    pub topology: ClusterHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwnerResponseStatus {
    Ok,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwnerResponse {
    pub status: LockOwnerResponseStatus,
    pub owner: Option<LockOwner>,
    pub topology: ClusterHash,
}

/// Request/reply pairs carried by a [`LockChannel`](super::LockChannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProtocol {
    Lock(LockRequest),
    Unlock(UnlockRequest),
    Owner(LockOwnerRequest),
}

impl LockProtocol {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LockProtocol::Lock(_) => "lock",
            LockProtocol::Unlock(_) => "unlock",
            LockProtocol::Owner(_) => "lock-owner",
        }
    }

    pub fn topology(&self) -> ClusterHash {
        match self {
            LockProtocol::Lock(r) => r.topology,
            LockProtocol::Unlock(r) => r.topology,
            LockProtocol::Owner(r) => r.topology,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProtocolReply {
    Lock(LockResponse),
    Unlock(UnlockResponse),
    Owner(LockOwnerResponse),
}

impl LockProtocolReply {
    pub fn kind(&self) -> &'static str {
        match self {
            LockProtocolReply::Lock(_) => "lock",
            LockProtocolReply::Unlock(_) => "unlock",
            LockProtocolReply::Owner(_) => "lock-owner",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: LockResponseStatus) -> LockResponse {
        LockResponse {
            status,
            owner: None,
            topology: ClusterHash::of(&[ClusterNodeId::new()]),
        }
    }

    #[test]
    fn busy_is_partial_only_with_feedback() {
        let busy = response(LockResponseStatus::LockBusy);
        assert!(busy.is_final(false));
        assert!(!busy.is_final(true));

        let change = response(LockResponseStatus::LockOwnerChange);
        assert!(!change.is_final(true));
    }

    #[test]
    fn grants_and_timeouts_are_final() {
        for status in [
            LockResponseStatus::Ok,
            LockResponseStatus::LockTimeout,
            LockResponseStatus::Retry,
        ] {
            assert!(response(status).is_final(true));
        }
    }

    #[test]
    fn protocol_topology() {
        let hash = ClusterHash::of(&[ClusterNodeId::new()]);
        let request = LockProtocol::Owner(LockOwnerRequest {
            region: "r".into(),
            name: "n".into(),
            topology: hash,
        });
        assert_eq!(request.topology(), hash);
        assert_eq!(request.kind(), "lock-owner");
    }
}
