//! Lock regions and the lock handles callers hold.
//!
//! A [`LockRegion`] owns every active [`LockControllerClient`] of one
//! namespace. It forwards topology changes to them, runs their retry loops
//! as tokio tasks and terminates them all on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cinder_cluster::{ClusterNode, ClusterNodeId, ClusterTopology, PartitionMapper};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::channel::{LockChannel, RetryPolicy};
use super::client::{
    Dispatch, LockClientStatus, LockControllerClient, LockFuture, LockReplyAction, OwnerUpdate,
};
use super::protocol::{
    LockOwner, LockOwnerResponseStatus, LockProtocol, LockProtocolReply, LockResponseStatus,
    UnlockResponseStatus,
};
use crate::config::{CoordConfig, LockConfig};
use crate::CoordError;

/// Notifications for locks acquired with [`DistributedLock::lock_async`].
///
/// Called from lock tasks, never while the client's mutex is held.
pub trait AsyncLockCallback: Send + Sync {
    fn on_lock_acquire(&self);

    /// The lock is held by `owner`. This node stays queued.
    fn on_lock_busy(&self, _owner: &LockOwner) {}

    /// Ownership moved to `owner` while this node is still queued.
    fn on_lock_owner_change(&self, _owner: &LockOwner) {}

    /// A lock acquired earlier was released or terminated.
    fn on_lock_release(&self) {}
}

/// A named lock shared across the cluster.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    fn region(&self) -> &str;

    fn name(&self) -> &str;

    /// Waits until the lock is acquired.
    async fn lock(&self) -> Result<(), CoordError>;

    /// Acquires the lock only if nobody holds it.
    async fn try_lock(&self) -> Result<bool, CoordError>;

    /// Queues for the lock and returns immediately. Progress is reported
    /// through `callback`.
    async fn lock_async(&self, callback: Arc<dyn AsyncLockCallback>) -> Result<(), CoordError>;

    /// Releases the lock or cancels a pending acquisition.
    async fn unlock(&self) -> Result<(), CoordError>;

    fn is_held(&self) -> bool;
}

struct RegionState {
    topology: Option<ClusterTopology>,
    clients: HashMap<u64, Arc<LockControllerClient>>,
    terminated: bool,
}

/// Namespace of distributed locks managed by one set of lock managers.
pub struct LockRegion {
    name: String,
    node: ClusterNodeId,
    channel: Arc<dyn LockChannel>,
    mapper: Arc<dyn PartitionMapper>,
    policy: RetryPolicy,
    next_lock_id: AtomicU64,
    next_thread_id: AtomicU64,
    state: Mutex<RegionState>,
}

impl std::fmt::Debug for LockRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegion")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("policy", &self.policy)
            .field("active_locks", &self.active_locks())
            .finish_non_exhaustive()
    }
}

impl LockRegion {
    pub fn new(
        name: impl Into<String>,
        node: ClusterNodeId,
        channel: Arc<dyn LockChannel>,
        mapper: Arc<dyn PartitionMapper>,
        config: &LockConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            node,
            channel,
            mapper,
            policy: config.retry_policy(),
            next_lock_id: AtomicU64::new(1),
            next_thread_id: AtomicU64::new(1),
            state: Mutex::new(RegionState {
                topology: None,
                clients: HashMap::new(),
                terminated: false,
            }),
        })
    }

    /// Creates the region that election groups lock in, named by
    /// `config.election.region`.
    pub fn for_elections(
        node: ClusterNodeId,
        channel: Arc<dyn LockChannel>,
        mapper: Arc<dyn PartitionMapper>,
        config: &CoordConfig,
    ) -> Arc<Self> {
        Self::new(
            config.election.region.clone(),
            node,
            channel,
            mapper,
            &config.lock,
        )
    }

    fn state(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a new handle to the lock `name`. Every handle is a distinct
    /// owner from the managers' point of view.
    pub fn get(self: &Arc<Self>, name: impl Into<String>) -> ClusterLock {
        ClusterLock {
            region: Arc::clone(self),
            name: name.into(),
            thread_id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            current: Mutex::new(None),
        }
    }

    /// Number of clients that are acquiring, holding or releasing a lock.
    pub fn active_locks(&self) -> usize {
        self.state().clients.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().terminated
    }

    /// Lock manager responsible for `name` under the current topology.
    pub fn manager_of(&self, name: &str) -> Option<ClusterNode> {
        let state = self.state();
        let topology = state.topology.as_ref()?;
        let key = format!("{}/{}", self.name, name);
        self.mapper.map(key.as_bytes(), topology).primary
    }

    /// Applies a new topology to every active client. Held locks whose
    /// manager moved are re-registered with the new manager.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update_topology(self: &Arc<Self>, topology: ClusterTopology) {
        let mut state = self.state();
        if state.terminated {
            return;
        }
        let mut moved = Vec::new();
        for client in state.clients.values() {
            let before = client.manager().map(|n| n.id);
            let locked = client.update_and_check_locked(&topology, self.mapper.as_ref());
            if locked && client.manager().map(|n| n.id) != before {
                moved.push(Arc::clone(client));
            }
        }
        debug!(
            "lock region {} updated to topology {} ({} active)",
            self.name,
            topology.hash(),
            state.clients.len()
        );
        state.topology = Some(topology);
        drop(state);

        for client in moved {
            tokio::spawn(drive_relock(Arc::clone(self), client));
        }
    }

    /// Spawns a task applying every topology published on `topology`.
    /// The task ends when the sender is dropped or the region terminates.
    pub fn follow(self: &Arc<Self>, mut topology: watch::Receiver<ClusterTopology>) -> JoinHandle<()> {
        let region = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let current = topology.borrow_and_update().clone();
                region.update_topology(current);
                if region.is_terminated() || topology.changed().await.is_err() {
                    break;
                }
            }
            trace!("lock region {} stopped following topology", region.name);
        })
    }

    /// Terminates every active client. Pending lock futures fail with
    /// [`CoordError::Cancelled`] and later acquisitions with
    /// [`CoordError::Terminated`].
    pub fn terminate(&self) {
        let clients: Vec<_> = {
            let mut state = self.state();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.clients.drain().map(|(_, client)| client).collect()
        };
        for client in &clients {
            client.become_terminated();
        }
        info!(
            "lock region {} terminated ({} active locks)",
            self.name,
            clients.len()
        );
    }

    fn register(
        &self,
        client: LockControllerClient,
    ) -> Result<(Arc<LockControllerClient>, LockFuture), CoordError> {
        let mut state = self.state();
        if state.terminated {
            return Err(CoordError::Terminated);
        }
        if let Some(topology) = &state.topology {
            client.update(topology, self.mapper.as_ref());
        }
        let future = client.become_locking().ok_or(CoordError::Terminated)?;
        let client = Arc::new(client);
        state.clients.insert(client.lock_id(), Arc::clone(&client));
        Ok((client, future))
    }

    fn unregister(&self, lock_id: u64) {
        self.state().clients.remove(&lock_id);
    }

    fn unregister_if_done(&self, client: &LockControllerClient) {
        if matches!(
            client.status(),
            LockClientStatus::Unlocked | LockClientStatus::Terminated
        ) {
            self.unregister(client.lock_id());
        }
    }

    /// Sends `request` unless the client leaves `status` first.
    async fn request_while(
        &self,
        client: &LockControllerClient,
        status: LockClientStatus,
        manager: &ClusterNode,
        request: LockProtocol,
    ) -> Option<Result<LockProtocolReply, CoordError>> {
        let mut watch = client.watch_status();
        tokio::select! {
            reply = self.channel.request(manager, request) => Some(reply),
            _ = left(&mut watch, status) => None,
        }
    }

    /// Counts a failed lock attempt and waits before the next one. Once the
    /// policy runs out the attempt fails with `cause`.
    async fn retry(
        &self,
        client: &LockControllerClient,
        failures: &mut u32,
        cause: CoordError,
    ) -> bool {
        *failures += 1;
        if !self.policy.allows(*failures) {
            warn!(
                "lock {}/{}: giving up after {} attempts: {}",
                self.name,
                client.name(),
                failures,
                cause
            );
            client.give_up(cause);
            return false;
        }
        self.policy.backoff().await;
        client.is(LockClientStatus::Locking)
    }

    async fn request_lock(&self, client: &LockControllerClient) {
        let mut failures = 0;
        loop {
            let (manager, request) = match client.lock_request() {
                Dispatch::Idle => return,
                Dispatch::NoManager => {
                    trace!("lock {}/{}: no manager yet", self.name, client.name());
                    if !self.retry(client, &mut failures, CoordError::NoManager).await {
                        return;
                    }
                    continue;
                }
                Dispatch::Send { manager, request } => (manager, request),
            };

            let request = LockProtocol::Lock(request);
            let action = match self
                .request_while(client, LockClientStatus::Locking, &manager, request)
                .await
            {
                None => return,
                Some(Ok(LockProtocolReply::Lock(response))) => client.on_lock_response(&response),
                Some(Ok(other)) => {
                    warn!("unexpected {} reply to a lock request", other.kind());
                    LockReplyAction::Retry
                }
                Some(Err(e)) if !e.is_transient() => {
                    warn!("lock request for {}/{} failed: {}", self.name, client.name(), e);
                    client.give_up(e);
                    return;
                }
                Some(Err(e)) => {
                    debug!(
                        "lock request for {}/{} to {} failed: {}",
                        self.name,
                        client.name(),
                        manager.id,
                        e
                    );
                    LockReplyAction::Retry
                }
            };

            if action == LockReplyAction::Done
                || !self.retry(client, &mut failures, CoordError::Timeout).await
            {
                return;
            }
        }
    }

    async fn subscribe_lock(&self, client: &LockControllerClient) {
        let mut failures = 0;
        let mut status = client.watch_status();
        loop {
            let (manager, request) = match client.lock_request() {
                Dispatch::Idle => return,
                Dispatch::NoManager => {
                    if !self.retry(client, &mut failures, CoordError::NoManager).await {
                        return;
                    }
                    continue;
                }
                Dispatch::Send { manager, request } => (manager, request),
            };

            let mut replies = match self.channel.subscribe(&manager, request).await {
                Ok(replies) => replies,
                Err(e) if !e.is_transient() => {
                    warn!("lock subscription for {}/{} failed: {}", self.name, client.name(), e);
                    client.give_up(e);
                    return;
                }
                Err(e) => {
                    debug!(
                        "lock subscription for {}/{} to {} failed: {}",
                        self.name,
                        client.name(),
                        manager.id,
                        e
                    );
                    if !self.retry(client, &mut failures, CoordError::Timeout).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                let response = tokio::select! {
                    response = replies.recv() => response,
                    _ = left(&mut status, LockClientStatus::Locking) => return,
                };
                let Some(response) = response else {
                    debug!("lock subscription for {}/{} closed", self.name, client.name());
                    break;
                };
                match client.on_lock_response(&response) {
                    LockReplyAction::Done => return,
                    LockReplyAction::Wait => {}
                    LockReplyAction::QueryOwner => {
                        if !self.query_owner(client).await {
                            return;
                        }
                    }
                    LockReplyAction::Retry => break,
                }
            }

            if !self.retry(client, &mut failures, CoordError::Timeout).await {
                return;
            }
        }
    }

    /// Asks the manager for the owner until an answer matching the cached
    /// topology arrives. Returns false once the client stopped locking.
    async fn query_owner(&self, client: &LockControllerClient) -> bool {
        let mut failures = 0;
        loop {
            if let Dispatch::Send { manager, request } = client.owner_request() {
                let request = LockProtocol::Owner(request);
                match self
                    .request_while(client, LockClientStatus::Locking, &manager, request)
                    .await
                {
                    None => return false,
                    Some(Ok(LockProtocolReply::Owner(response)))
                        if response.status == LockOwnerResponseStatus::Ok =>
                    {
                        match client.on_owner_change(response.owner, response.topology) {
                            OwnerUpdate::Applied => return true,
                            OwnerUpdate::Ignored => return false,
                            OwnerUpdate::Stale => {
                                trace!("lock {}/{}: stale owner reply", self.name, client.name())
                            }
                        }
                    }
                    Some(Ok(LockProtocolReply::Owner(_))) => {}
                    Some(Ok(other)) => {
                        warn!("unexpected {} reply to an owner request", other.kind())
                    }
                    Some(Err(e)) => debug!("owner request for {}/{} failed: {}", self.name, client.name(), e),
                }
            } else if client.owner_request() == Dispatch::Idle {
                return false;
            }
            if !self.retry(client, &mut failures, CoordError::Timeout).await {
                return false;
            }
        }
    }

    async fn request_unlock(&self, client: &LockControllerClient) {
        loop {
            match client.unlock_request() {
                Dispatch::Idle => return,
                Dispatch::NoManager => {}
                Dispatch::Send { manager, request } => {
                    let request = LockProtocol::Unlock(request);
                    match self
                        .request_while(client, LockClientStatus::Unlocking, &manager, request)
                        .await
                    {
                        None => return,
                        Some(Ok(LockProtocolReply::Unlock(response)))
                            if response.status == UnlockResponseStatus::Ok =>
                        {
                            if client.try_become_unlocked(response.topology) {
                                return;
                            }
                        }
                        Some(Ok(LockProtocolReply::Unlock(_))) => {}
                        Some(Ok(other)) => {
                            warn!("unexpected {} reply to an unlock request", other.kind())
                        }
                        Some(Err(e)) => debug!(
                            "unlock request for {}/{} to {} failed: {}",
                            self.name,
                            client.name(),
                            manager.id,
                            e
                        ),
                    }
                }
            }
            self.policy.backoff().await;
        }
    }
}

async fn left(status: &mut watch::Receiver<LockClientStatus>, from: LockClientStatus) {
    let _ = status.wait_for(|s| *s != from).await;
}

async fn drive_lock(region: Arc<LockRegion>, client: Arc<LockControllerClient>) {
    if client.with_feedback() {
        region.subscribe_lock(&client).await;
    } else {
        region.request_lock(&client).await;
    }
    region.unregister_if_done(&client);
}

async fn drive_unlock(region: Arc<LockRegion>, client: Arc<LockControllerClient>) {
    region.request_unlock(&client).await;
    region.unregister_if_done(&client);
}

async fn drive_relock(region: Arc<LockRegion>, client: Arc<LockControllerClient>) {
    let mut failures = 0;
    loop {
        let Dispatch::Send { manager, request } = client.relock_request() else {
            return;
        };
        let request = LockProtocol::Lock(request);
        match region
            .request_while(&client, LockClientStatus::Locked, &manager, request)
            .await
        {
            None => return,
            Some(Ok(LockProtocolReply::Lock(response))) => match response.status {
                LockResponseStatus::Ok if Some(response.topology) == client.topology_hash() => {
                    debug!(
                        "lock {}/{} moved to manager {}",
                        region.name,
                        client.name(),
                        manager.id
                    );
                    return;
                }
                LockResponseStatus::Ok | LockResponseStatus::Retry => {}
                status => {
                    warn!(
                        "lock {}/{} could not move to manager {}: {:?}",
                        region.name,
                        client.name(),
                        manager.id,
                        status
                    );
                    return;
                }
            },
            Some(Ok(other)) => warn!("unexpected {} reply to a lock request", other.kind()),
            Some(Err(e)) => debug!("relock of {}/{} failed: {}", region.name, client.name(), e),
        }
        failures += 1;
        if !region.policy.allows(failures) {
            warn!(
                "lock {}/{}: giving up moving to manager {}",
                region.name,
                client.name(),
                manager.id
            );
            return;
        }
        region.policy.backoff().await;
    }
}

/// Handle to one named lock in a region.
///
/// A handle acquires at most once at a time. Handles are independent
/// owners: two handles to the same name exclude each other.
pub struct ClusterLock {
    region: Arc<LockRegion>,
    name: String,
    thread_id: u64,
    current: Mutex<Option<Arc<LockControllerClient>>>,
}

impl std::fmt::Debug for ClusterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLock")
            .field("region", &self.region.name)
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl ClusterLock {
    fn current(&self) -> MutexGuard<'_, Option<Arc<LockControllerClient>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Status of the latest acquisition, if any.
    pub fn status(&self) -> Option<LockClientStatus> {
        self.current().as_ref().map(|client| client.status())
    }

    /// Owner reported while this handle was queued.
    pub fn owner(&self) -> Option<LockOwner> {
        self.current().as_ref().and_then(|client| client.owner())
    }

    /// Starts an acquisition. `Ok(None)` means the lock is already held by
    /// this handle.
    fn start(
        &self,
        timeout: Option<Duration>,
        callback: Option<Arc<dyn AsyncLockCallback>>,
    ) -> Result<Option<LockFuture>, CoordError> {
        let mut current = self.current();
        if let Some(client) = current.as_ref() {
            match client.status() {
                LockClientStatus::Locked => return Ok(None),
                LockClientStatus::Locking | LockClientStatus::Unlocking => {
                    return Err(CoordError::InProgress)
                }
                LockClientStatus::Unlocked | LockClientStatus::Terminated => {}
            }
        }

        let lock_id = self.region.next_lock_id.fetch_add(1, Ordering::Relaxed);
        let mut client = LockControllerClient::new(
            lock_id,
            self.region.name.clone(),
            self.name.clone(),
            self.region.node,
            self.thread_id,
        );
        if let Some(timeout) = timeout {
            client = client.with_timeout(timeout);
        }
        if let Some(callback) = callback {
            client = client.with_callback(callback);
        }

        let (client, future) = self.region.register(client)?;
        *current = Some(Arc::clone(&client));
        drop(current);

        trace!("lock {}/{}: acquiring as {}", self.region.name, self.name, lock_id);
        tokio::spawn(drive_lock(Arc::clone(&self.region), client));
        Ok(Some(future))
    }

    /// Like [`DistributedLock::try_lock`], but lets the manager queue the
    /// request for up to `timeout`.
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<bool, CoordError> {
        match self.start(Some(timeout), None)? {
            None => Ok(true),
            Some(future) => future.await,
        }
    }
}

#[async_trait]
impl DistributedLock for ClusterLock {
    fn region(&self) -> &str {
        &self.region.name
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> Result<(), CoordError> {
        let Some(future) = self.start(None, None)? else {
            return Ok(());
        };
        match future.await? {
            true => Ok(()),
            false => Err(CoordError::Timeout),
        }
    }

    async fn try_lock(&self) -> Result<bool, CoordError> {
        self.try_lock_for(Duration::ZERO).await
    }

    async fn lock_async(&self, callback: Arc<dyn AsyncLockCallback>) -> Result<(), CoordError> {
        if self.start(None, Some(Arc::clone(&callback)))?.is_none() {
            callback.on_lock_acquire();
        }
        Ok(())
    }

    async fn unlock(&self) -> Result<(), CoordError> {
        let Some(client) = self.current().clone() else {
            return Ok(());
        };
        if client.become_unlocking() {
            tokio::spawn(drive_unlock(Arc::clone(&self.region), Arc::clone(&client)));
        }
        client.await_unlocked().await;
        self.region.unregister(client.lock_id());
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.status() == Some(LockClientStatus::Locked)
    }
}
