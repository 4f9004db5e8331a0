//! Leader election on top of a distributed lock.
//!
//! Whoever holds the group's lock leads; everybody else stays queued for it
//! with feedback enabled and follows the owner the lock manager reports. A
//! [`CandidateHandler`] turns those lock notifications into leader and
//! follower contexts for the user's [`Candidate`]. It is driven by one
//! worker task per group and is not shared between threads.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use cinder_cluster::ClusterNode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::context::{FollowerContext, LeaderContext};
use crate::lock::{AsyncLockCallback, DistributedLock, LockOwner};
use crate::CoordError;

/// User code taking part in an election.
pub trait Candidate: Send + 'static {
    /// This node now holds the group's lock.
    fn become_leader(&mut self, ctx: LeaderContext);

    /// Another node holds the lock. `ctx` follows it.
    fn become_follower(&mut self, ctx: FollowerContext);

    /// The election stopped.
    fn terminate(&mut self);
}

/// Inputs of a [`CandidateHandler`], delivered in order by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    Acquired,
    Busy(LockOwner),
    OwnerChanged(LockOwner),
    /// A leader context asked to step down. Carries the context's epoch.
    Yield(u64),
}

/// Forwards lock notifications to the worker's event queue.
struct ElectionCallback {
    events: mpsc::UnboundedSender<ElectionEvent>,
}

impl ElectionCallback {
    fn send(&self, event: ElectionEvent) {
        if self.events.send(event).is_err() {
            trace!("election worker gone, lock notification dropped");
        }
    }
}

impl AsyncLockCallback for ElectionCallback {
    fn on_lock_acquire(&self) {
        self.send(ElectionEvent::Acquired);
    }

    fn on_lock_busy(&self, owner: &LockOwner) {
        self.send(ElectionEvent::Busy(owner.clone()));
    }

    fn on_lock_owner_change(&self, owner: &LockOwner) {
        self.send(ElectionEvent::OwnerChanged(owner.clone()));
    }
}

/// Resolves to the group's leader.
#[derive(Debug)]
pub struct LeaderFuture {
    rx: oneshot::Receiver<Result<ClusterNode, CoordError>>,
}

impl Future for LeaderFuture {
    type Output = Result<ClusterNode, CoordError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(CoordError::Cancelled)))
    }
}

/// Election state of one group on this node.
pub struct CandidateHandler<C: Candidate> {
    group: String,
    local: ClusterNode,
    candidate: C,
    lock: Arc<dyn DistributedLock>,
    callback: Arc<dyn AsyncLockCallback>,
    events: mpsc::UnboundedSender<ElectionEvent>,
    leader_ctx: Option<LeaderContext>,
    follower_ctx: Option<FollowerContext>,
    leader: Option<ClusterNode>,
    waiters: Vec<oneshot::Sender<Result<ClusterNode, CoordError>>>,
    epoch: u64,
    terminated: bool,
}

impl<C: Candidate> std::fmt::Debug for CandidateHandler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateHandler")
            .field("group", &self.group)
            .field("leader", &self.leader.as_ref().map(|n| n.id))
            .field("is_leader", &self.is_leader())
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl<C: Candidate> CandidateHandler<C> {
    /// Lock notifications and leader yields are sent to `events`; the owner
    /// of the receiving end must feed them back through [`handle`].
    ///
    /// [`handle`]: CandidateHandler::handle
    pub fn new(
        group: impl Into<String>,
        local: ClusterNode,
        candidate: C,
        lock: Arc<dyn DistributedLock>,
        events: mpsc::UnboundedSender<ElectionEvent>,
    ) -> Self {
        let callback = Arc::new(ElectionCallback {
            events: events.clone(),
        });
        Self {
            group: group.into(),
            local,
            candidate,
            lock,
            callback,
            events,
            leader_ctx: None,
            follower_ctx: None,
            leader: None,
            waiters: Vec::new(),
            epoch: 0,
            terminated: false,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn candidate(&self) -> &C {
        &self.candidate
    }

    pub fn is_leader(&self) -> bool {
        self.leader_ctx.is_some()
    }

    /// Last known leader.
    pub fn leader(&self) -> Option<&ClusterNode> {
        self.leader.as_ref()
    }

    pub fn leader_context(&self) -> Option<&LeaderContext> {
        self.leader_ctx.as_ref()
    }

    pub fn follower_context(&self) -> Option<&FollowerContext> {
        self.follower_ctx.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Queues for the group's lock.
    pub fn start(&self) {
        if self.terminated {
            return;
        }
        debug!("election {}: queueing for leadership", self.group);
        self.enter_queue(false);
    }

    fn enter_queue(&self, unlock_first: bool) {
        let lock = Arc::clone(&self.lock);
        let callback = Arc::clone(&self.callback);
        let group = self.group.clone();
        tokio::spawn(async move {
            if unlock_first {
                if let Err(e) = lock.unlock().await {
                    warn!("election {}: failed to release leadership: {}", group, e);
                }
            }
            if let Err(e) = lock.lock_async(callback).await {
                warn!("election {}: failed to queue for leadership: {}", group, e);
            }
        });
    }

    /// Applies one event.
    pub fn handle(&mut self, event: ElectionEvent) {
        match event {
            ElectionEvent::Acquired => self.on_lock_acquire(),
            ElectionEvent::Busy(owner) => self.on_lock_busy(owner),
            ElectionEvent::OwnerChanged(owner) => self.on_lock_owner_change(owner),
            ElectionEvent::Yield(epoch) => {
                if epoch == self.epoch {
                    self.yield_leadership();
                } else {
                    trace!("election {}: ignoring stale yield", self.group);
                }
            }
        }
    }

    pub fn on_lock_acquire(&mut self) {
        if self.terminated || self.leader_ctx.is_some() {
            return;
        }
        if let Some(follower) = self.follower_ctx.take() {
            follower.dispose();
        }
        self.epoch += 1;
        let ctx = LeaderContext::new(
            self.group.clone(),
            self.local.clone(),
            self.epoch,
            self.events.clone(),
        );
        self.leader_ctx = Some(ctx.clone());

        info!("election {}: became leader", self.group);
        self.candidate.become_leader(ctx);
        self.set_leader(self.local.clone());
    }

    pub fn on_lock_busy(&mut self, owner: LockOwner) {
        if self.terminated {
            return;
        }
        if self.follower_ctx.is_some() {
            self.on_lock_owner_change(owner);
            return;
        }
        if let Some(leader) = self.leader_ctx.take() {
            leader.dispose();
        }
        self.epoch += 1;
        let ctx = FollowerContext::new(self.group.clone(), self.local.clone(), owner.node.clone());
        self.follower_ctx = Some(ctx.clone());

        info!("election {}: following {}", self.group, owner.node.id);
        self.candidate.become_follower(ctx);
        self.set_leader(owner.node);
    }

    pub fn on_lock_owner_change(&mut self, owner: LockOwner) {
        if self.terminated {
            return;
        }
        let Some(ctx) = &self.follower_ctx else {
            debug!(
                "election {}: owner change to {} while not following",
                self.group, owner.node.id
            );
            return;
        };
        if ctx.set_leader(owner.node.clone()) {
            info!("election {}: leader is now {}", self.group, owner.node.id);
            self.set_leader(owner.node);
        }
    }

    /// Releases leadership and queues for it again. The outcome arrives as
    /// a later acquire or busy notification.
    pub fn yield_leadership(&mut self) {
        if self.terminated {
            return;
        }
        let Some(leader) = self.leader_ctx.take() else {
            return;
        };
        leader.dispose();
        self.epoch += 1;
        self.leader = None;

        info!("election {}: yielding leadership", self.group);
        self.enter_queue(true);
    }

    /// Resolves with the current leader, or with the first one elected.
    pub fn leader_future(&mut self) -> LeaderFuture {
        let (tx, rx) = oneshot::channel();
        if self.terminated {
            let _ = tx.send(Err(CoordError::Cancelled));
        } else if let Some(leader) = &self.leader {
            let _ = tx.send(Ok(leader.clone()));
        } else {
            self.waiters.push(tx);
        }
        LeaderFuture { rx }
    }

    /// Resolves on the next leadership change.
    pub fn next_leader(&mut self) -> LeaderFuture {
        let (tx, rx) = oneshot::channel();
        if self.terminated {
            let _ = tx.send(Err(CoordError::Cancelled));
        } else {
            self.waiters.push(tx);
        }
        LeaderFuture { rx }
    }

    fn set_leader(&mut self, leader: ClusterNode) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(leader.clone()));
        }
        self.leader = Some(leader);
    }

    /// Stops taking part. Pending leader futures are cancelled and the lock
    /// is released by a separate task, returned for callers that want to
    /// wait for it.
    pub fn terminate(&mut self) -> Option<JoinHandle<()>> {
        if self.terminated {
            return None;
        }
        self.terminated = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(CoordError::Cancelled));
        }

        let mut active = false;
        if let Some(leader) = self.leader_ctx.take() {
            leader.dispose();
            active = true;
        }
        if let Some(follower) = self.follower_ctx.take() {
            follower.dispose();
            active = true;
        }
        if active {
            self.candidate.terminate();
        }

        info!("election {}: terminated", self.group);
        let lock = Arc::clone(&self.lock);
        let group = self.group.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = lock.unlock().await {
                debug!("election {}: unlock on termination failed: {}", group, e);
            }
        }))
    }
}
