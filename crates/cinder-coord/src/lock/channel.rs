//! Transport seam between lock clients and lock managers.

use std::time::Duration;

use async_trait::async_trait;
use cinder_cluster::ClusterNode;
use tokio::sync::mpsc;

use super::protocol::{LockProtocol, LockProtocolReply, LockRequest, LockResponse};
use crate::CoordError;

/// Request/reply transport to the lock manager owning a lock.
///
/// Wire format and connection handling belong to the implementation. The
/// lock client only relies on one reply per request, and on a stream of
/// partial replies ending with a final one for subscriptions.
#[async_trait]
pub trait LockChannel: Send + Sync + 'static {
    /// Sends `request` to `manager` and waits for its reply.
    async fn request(
        &self,
        manager: &ClusterNode,
        request: LockProtocol,
    ) -> Result<LockProtocolReply, CoordError>;

    /// Sends a lock request that asked for feedback. The receiver yields
    /// `LockBusy`/`LockOwnerChange` updates and closes after a final reply.
    async fn subscribe(
        &self,
        manager: &ClusterNode,
        request: LockRequest,
    ) -> Result<mpsc::Receiver<LockResponse>, CoordError>;
}

/// How often and how long lock requests are retried.
///
/// The retry loops re-check the client's status before every attempt, so a
/// retry stops as soon as the local state no longer needs the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }

    /// Sleeps for one retry interval.
    pub async fn backoff(&self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_by_default() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(u32::MAX));
    }

    #[test]
    fn bounded_attempts() {
        let policy = RetryPolicy::new(Duration::ZERO, Some(2));
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[tokio::test]
    async fn zero_interval_backoff_returns() {
        RetryPolicy::new(Duration::ZERO, None).backoff().await;
    }
}
