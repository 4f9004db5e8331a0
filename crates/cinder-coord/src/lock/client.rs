//! Client side of a single lock acquisition.
//!
//! A [`LockControllerClient`] tracks one (lock, thread) pair through
//! `Unlocked -> Locking -> Locked -> Unlocking -> Unlocked`, with
//! `Terminated` reachable from anywhere. Every transition happens under one
//! mutex and never across an await; the retry loops in the region read the
//! status through [`LockControllerClient::lock_request`] and friends to
//! decide whether a reply still matters.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use cinder_cluster::{ClusterHash, ClusterNode, ClusterNodeId, ClusterTopology, PartitionMapper};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use super::protocol::{
    LockOwner, LockOwnerRequest, LockRequest, LockResponse, LockResponseStatus, UnlockRequest,
};
use super::AsyncLockCallback;
use crate::CoordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClientStatus {
    Locking,
    Locked,
    Unlocking,
    Unlocked,
    Terminated,
}

impl LockClientStatus {
    fn can_become(self, next: LockClientStatus) -> bool {
        use LockClientStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Unlocked, Locking)
            | (Locking, Locked)
            | (Locking, Unlocking)
            | (Locking, Unlocked)
            | (Locked, Unlocking)
            | (Unlocking, Unlocked) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LockClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockClientStatus::Locking => write!(f, "locking"),
            LockClientStatus::Locked => write!(f, "locked"),
            LockClientStatus::Unlocking => write!(f, "unlocking"),
            LockClientStatus::Unlocked => write!(f, "unlocked"),
            LockClientStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// What a retry loop should send next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<R> {
    /// Send `request` to the lock manager.
    Send { manager: ClusterNode, request: R },
    /// Still pending, but no node can manage the lock yet.
    NoManager,
    /// The client moved on. Stop retrying.
    Idle,
}

/// How the lock retry loop continues after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReplyAction {
    /// The attempt finished, one way or the other.
    Done,
    /// Send the lock request again.
    Retry,
    /// Ask the manager who owns the lock, then keep waiting.
    QueryOwner,
    /// A partial reply was applied. Keep waiting for more.
    Wait,
}

/// Outcome of applying an owner change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerUpdate {
    Applied,
    /// Computed under a different topology. Query the owner explicitly.
    Stale,
    Ignored,
}

/// Resolves once a lock attempt completes: `Ok(true)` when acquired,
/// `Ok(false)` when the manager refused or the attempt was cancelled by an
/// unlock, and an error on termination or when retries run out.
#[derive(Debug)]
pub struct LockFuture {
    rx: oneshot::Receiver<Result<bool, CoordError>>,
}

impl Future for LockFuture {
    type Output = Result<bool, CoordError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(CoordError::Cancelled)))
    }
}

struct ClientState {
    status: LockClientStatus,
    topology: Option<ClusterTopology>,
    manager: Option<ClusterNode>,
    owner: Option<LockOwner>,
    lock_tx: Option<oneshot::Sender<Result<bool, CoordError>>>,
    acquired: bool,
    status_tx: watch::Sender<LockClientStatus>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            status: LockClientStatus::Unlocked,
            topology: None,
            manager: None,
            owner: None,
            lock_tx: None,
            acquired: false,
            status_tx: watch::channel(LockClientStatus::Unlocked).0,
        }
    }

    fn set_status(&mut self, next: LockClientStatus) {
        assert!(
            self.status.can_become(next),
            "unexpected lock status transition {} -> {}",
            self.status,
            next
        );
        self.status = next;
        self.status_tx.send_replace(next);
    }

    fn hash(&self) -> Option<ClusterHash> {
        self.topology.as_ref().map(ClusterTopology::hash)
    }

    fn complete_lock(&mut self, result: Result<bool, CoordError>) {
        if let Some(tx) = self.lock_tx.take() {
            let _ = tx.send(result);
        }
    }

    fn dispatch<R>(&self, request: impl FnOnce(ClusterHash) -> R) -> Dispatch<R> {
        match (&self.manager, self.hash()) {
            (Some(manager), Some(hash)) => Dispatch::Send {
                manager: manager.clone(),
                request: request(hash),
            },
            _ => Dispatch::NoManager,
        }
    }
}

/// Per-(lock, thread) client state machine.
pub struct LockControllerClient {
    lock_id: u64,
    region: String,
    name: String,
    node: ClusterNodeId,
    thread_id: u64,
    timeout: Option<Duration>,
    callback: Option<Arc<dyn AsyncLockCallback>>,
    state: Mutex<ClientState>,
}

impl std::fmt::Debug for LockControllerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockControllerClient")
            .field("lock_id", &self.lock_id)
            .field("region", &self.region)
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl LockControllerClient {
    pub fn new(
        lock_id: u64,
        region: impl Into<String>,
        name: impl Into<String>,
        node: ClusterNodeId,
        thread_id: u64,
    ) -> Self {
        Self {
            lock_id,
            region: region.into(),
            name: name.into(),
            node,
            thread_id,
            timeout: None,
            callback: None,
            state: Mutex::new(ClientState::new()),
        }
    }

    /// Limits how long the manager may queue the lock request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requests busy and owner-change feedback, delivered to `callback`.
    pub fn with_callback(mut self, callback: Arc<dyn AsyncLockCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn with_feedback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn status(&self) -> LockClientStatus {
        self.state().status
    }

    pub fn is(&self, status: LockClientStatus) -> bool {
        self.status() == status
    }

    /// Lock manager for the cached topology.
    pub fn manager(&self) -> Option<ClusterNode> {
        self.state().manager.clone()
    }

    /// Last owner reported by the manager while this client waited.
    pub fn owner(&self) -> Option<LockOwner> {
        self.state().owner.clone()
    }

    pub fn topology_hash(&self) -> Option<ClusterHash> {
        self.state().hash()
    }

    fn key(&self) -> Vec<u8> {
        format!("{}/{}", self.region, self.name).into_bytes()
    }

    /// Caches `topology` and recomputes the lock manager. Returns true if
    /// the manager changed.
    pub fn update(&self, topology: &ClusterTopology, mapper: &dyn PartitionMapper) -> bool {
        let manager = mapper.map(&self.key(), topology).primary;
        let mut state = self.state();
        let changed = state.manager.as_ref().map(|n| n.id) != manager.as_ref().map(|n| n.id);
        if changed {
            debug!(
                "lock {}/{} manager is now {}",
                self.region,
                self.name,
                manager
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |n| n.id.to_string())
            );
        }
        state.topology = Some(topology.clone());
        state.manager = manager;
        changed
    }

    /// Refreshes the topology and reports whether the lock is still held.
    pub fn update_and_check_locked(
        &self,
        topology: &ClusterTopology,
        mapper: &dyn PartitionMapper,
    ) -> bool {
        self.update(topology, mapper);
        self.is(LockClientStatus::Locked)
    }

    /// `Unlocked -> Locking`. Returns the future of this attempt, or `None`
    /// if the client is busy or terminated.
    pub fn become_locking(&self) -> Option<LockFuture> {
        let mut state = self.state();
        if state.status != LockClientStatus::Unlocked {
            return None;
        }
        state.set_status(LockClientStatus::Locking);
        state.owner = None;
        let (tx, rx) = oneshot::channel();
        state.lock_tx = Some(tx);
        Some(LockFuture { rx })
    }

    /// The lock request to (re)send while locking.
    pub fn lock_request(&self) -> Dispatch<LockRequest> {
        let state = self.state();
        if state.status != LockClientStatus::Locking {
            return Dispatch::Idle;
        }
        state.dispatch(|topology| LockRequest {
            lock_id: self.lock_id,
            region: self.region.clone(),
            name: self.name.clone(),
            node: self.node,
            thread_id: self.thread_id,
            timeout: self.timeout,
            with_feedback: self.with_feedback(),
            topology,
        })
    }

    /// Lock request re-registering a held lock with a new manager.
    pub fn relock_request(&self) -> Dispatch<LockRequest> {
        let state = self.state();
        if state.status != LockClientStatus::Locked {
            return Dispatch::Idle;
        }
        state.dispatch(|topology| LockRequest {
            lock_id: self.lock_id,
            region: self.region.clone(),
            name: self.name.clone(),
            node: self.node,
            thread_id: self.thread_id,
            timeout: Some(Duration::ZERO),
            with_feedback: false,
            topology,
        })
    }

    /// `Locking -> Locked`, if `topology` matches the cached topology.
    pub fn become_locked(&self, topology: ClusterHash) -> bool {
        let mut state = self.state();
        if state.status != LockClientStatus::Locking {
            return false;
        }
        if state.hash() != Some(topology) {
            debug!(
                "lock {}/{}: ignoring grant computed under topology {}",
                self.region, self.name, topology
            );
            return false;
        }
        state.set_status(LockClientStatus::Locked);
        state.acquired = true;
        state.owner = None;
        state.complete_lock(Ok(true));
        drop(state);

        debug!("lock {}/{} acquired", self.region, self.name);
        if let Some(callback) = &self.callback {
            callback.on_lock_acquire();
        }
        true
    }

    /// `Locking -> Unlocked` after the manager refused the lock.
    pub fn become_unlocked(&self) -> bool {
        self.abandon_locking(Ok(false))
    }

    /// `Locking -> Unlocked` when the attempt can't continue.
    pub fn give_up(&self, error: CoordError) -> bool {
        self.abandon_locking(Err(error))
    }

    fn abandon_locking(&self, result: Result<bool, CoordError>) -> bool {
        let mut state = self.state();
        if state.status != LockClientStatus::Locking {
            return false;
        }
        state.set_status(LockClientStatus::Unlocked);
        state.complete_lock(result);
        true
    }

    /// Records the current owner of a busy lock while waiting in feedback
    /// mode.
    pub fn on_lock_busy(&self, owner: LockOwner) -> bool {
        let mut state = self.state();
        if state.status != LockClientStatus::Locking {
            return false;
        }
        state.owner = Some(owner.clone());
        drop(state);

        if let Some(callback) = &self.callback {
            callback.on_lock_busy(&owner);
        }
        true
    }

    /// Applies an owner reported under `topology`.
    pub fn on_owner_change(&self, owner: Option<LockOwner>, topology: ClusterHash) -> OwnerUpdate {
        let mut state = self.state();
        if state.status != LockClientStatus::Locking {
            return OwnerUpdate::Ignored;
        }
        if state.hash() != Some(topology) {
            return OwnerUpdate::Stale;
        }
        let Some(owner) = owner else {
            return OwnerUpdate::Applied;
        };
        if state.owner.as_ref() == Some(&owner) {
            return OwnerUpdate::Applied;
        }
        state.owner = Some(owner.clone());
        drop(state);

        trace!("lock {}/{} owner is now {}", self.region, self.name, owner);
        if let Some(callback) = &self.callback {
            callback.on_lock_owner_change(&owner);
        }
        OwnerUpdate::Applied
    }

    /// The owner query to (re)send while locking.
    pub fn owner_request(&self) -> Dispatch<LockOwnerRequest> {
        let state = self.state();
        if state.status != LockClientStatus::Locking {
            return Dispatch::Idle;
        }
        state.dispatch(|topology| LockOwnerRequest {
            region: self.region.clone(),
            name: self.name.clone(),
            topology,
        })
    }

    /// Applies a lock reply and tells the retry loop what to do next.
    pub fn on_lock_response(&self, response: &LockResponse) -> LockReplyAction {
        match response.status {
            LockResponseStatus::Ok => {
                if self.become_locked(response.topology) || !self.is(LockClientStatus::Locking) {
                    LockReplyAction::Done
                } else {
                    LockReplyAction::Retry
                }
            }
            LockResponseStatus::Retry => {
                if self.is(LockClientStatus::Locking) {
                    LockReplyAction::Retry
                } else {
                    LockReplyAction::Done
                }
            }
            LockResponseStatus::LockTimeout => {
                self.become_unlocked();
                LockReplyAction::Done
            }
            LockResponseStatus::LockBusy if self.with_feedback() => {
                if let Some(owner) = &response.owner {
                    self.on_lock_busy(owner.clone());
                }
                self.waiting()
            }
            LockResponseStatus::LockBusy => {
                self.become_unlocked();
                LockReplyAction::Done
            }
            LockResponseStatus::LockOwnerChange if self.with_feedback() => {
                match self.on_owner_change(response.owner.clone(), response.topology) {
                    OwnerUpdate::Stale => LockReplyAction::QueryOwner,
                    OwnerUpdate::Applied => LockReplyAction::Wait,
                    OwnerUpdate::Ignored => LockReplyAction::Done,
                }
            }
            LockResponseStatus::LockOwnerChange => {
                if self.is(LockClientStatus::Locking) {
                    LockReplyAction::Retry
                } else {
                    LockReplyAction::Done
                }
            }
        }
    }

    fn waiting(&self) -> LockReplyAction {
        if self.is(LockClientStatus::Locking) {
            LockReplyAction::Wait
        } else {
            LockReplyAction::Done
        }
    }

    /// `Locking -> Unlocking` (the pending attempt resolves `false`) or
    /// `Locked -> Unlocking`.
    pub fn become_unlocking(&self) -> bool {
        let mut state = self.state();
        match state.status {
            LockClientStatus::Locking => {
                state.set_status(LockClientStatus::Unlocking);
                state.complete_lock(Ok(false));
                true
            }
            LockClientStatus::Locked => {
                state.set_status(LockClientStatus::Unlocking);
                true
            }
            _ => false,
        }
    }

    /// `Locking -> Unlocking` only. A held lock stays held.
    pub fn become_unlocking_if_not_locked(&self) -> bool {
        let mut state = self.state();
        if state.status != LockClientStatus::Locking {
            return false;
        }
        state.set_status(LockClientStatus::Unlocking);
        state.complete_lock(Ok(false));
        true
    }

    /// The unlock request to (re)send while unlocking.
    pub fn unlock_request(&self) -> Dispatch<UnlockRequest> {
        let state = self.state();
        if state.status != LockClientStatus::Unlocking {
            return Dispatch::Idle;
        }
        state.dispatch(|topology| UnlockRequest {
            lock_id: self.lock_id,
            region: self.region.clone(),
            name: self.name.clone(),
            node: self.node,
            thread_id: self.thread_id,
            topology,
        })
    }

    /// `Unlocking -> Unlocked`, if `topology` matches the cached topology.
    pub fn try_become_unlocked(&self, topology: ClusterHash) -> bool {
        let mut state = self.state();
        if state.status != LockClientStatus::Unlocking || state.hash() != Some(topology) {
            return false;
        }
        state.set_status(LockClientStatus::Unlocked);
        let released = std::mem::take(&mut state.acquired);
        drop(state);

        debug!("lock {}/{} released", self.region, self.name);
        self.finish(released);
        true
    }

    /// Any state -> `Terminated`. A pending lock future fails with
    /// [`CoordError::Cancelled`] and unlock waiters are released.
    pub fn become_terminated(&self) -> bool {
        let mut state = self.state();
        if state.status == LockClientStatus::Terminated {
            return false;
        }
        state.set_status(LockClientStatus::Terminated);
        state.complete_lock(Err(CoordError::Cancelled));
        let released = std::mem::take(&mut state.acquired);
        drop(state);

        debug!("lock {}/{} terminated", self.region, self.name);
        self.finish(released);
        true
    }

    fn finish(&self, released: bool) {
        if released {
            if let Some(callback) = &self.callback {
                callback.on_lock_release();
            }
        }
    }

    /// Follows status changes.
    pub fn watch_status(&self) -> watch::Receiver<LockClientStatus> {
        self.state().status_tx.subscribe()
    }

    /// Waits until the client is unlocked or terminated.
    pub async fn await_unlocked(&self) {
        let mut rx = self.watch_status();
        let _ = rx
            .wait_for(|s| matches!(s, LockClientStatus::Unlocked | LockClientStatus::Terminated))
            .await;
    }
}
