//! Leader and follower contexts handed to candidates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cinder_cluster::ClusterNode;
use tokio::sync::mpsc;
use tracing::debug;

use super::ElectionEvent;

/// Called with the new leader when leadership moves while following.
pub type LeaderChangeListener = Arc<dyn Fn(&ClusterNode) + Send + Sync>;

/// Given to the candidate that won the election.
#[derive(Clone)]
pub struct LeaderContext {
    group: String,
    local: ClusterNode,
    epoch: u64,
    events: mpsc::UnboundedSender<ElectionEvent>,
    disposed: Arc<AtomicBool>,
}

impl std::fmt::Debug for LeaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderContext")
            .field("group", &self.group)
            .field("local", &self.local.id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl LeaderContext {
    pub(crate) fn new(
        group: String,
        local: ClusterNode,
        epoch: u64,
        events: mpsc::UnboundedSender<ElectionEvent>,
    ) -> Self {
        Self {
            group,
            local,
            epoch,
            events,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    /// Gives up leadership and queues for the lock again. Does nothing once
    /// this context has been replaced.
    pub fn yield_leadership(&self) {
        if self.is_disposed() {
            return;
        }
        if self.events.send(ElectionEvent::Yield(self.epoch)).is_err() {
            debug!("election {} already stopped, yield ignored", self.group);
        }
    }

    /// True once the election moved on from this leadership.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

struct FollowerShared {
    leader: Mutex<ClusterNode>,
    listeners: Mutex<Vec<LeaderChangeListener>>,
    disposed: AtomicBool,
}

/// Given to candidates that lost the election. Tracks the current leader
/// in place as ownership moves between other nodes.
#[derive(Clone)]
pub struct FollowerContext {
    group: String,
    local: ClusterNode,
    shared: Arc<FollowerShared>,
}

impl std::fmt::Debug for FollowerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowerContext")
            .field("group", &self.group)
            .field("leader", &self.leader().id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl FollowerContext {
    pub(crate) fn new(group: String, local: ClusterNode, leader: ClusterNode) -> Self {
        Self {
            group,
            local,
            shared: Arc::new(FollowerShared {
                leader: Mutex::new(leader),
                listeners: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    /// Node currently holding leadership.
    pub fn leader(&self) -> ClusterNode {
        self.shared
            .leader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Registers a callback for leadership changes.
    pub fn add_listener(&self, listener: impl Fn(&ClusterNode) + Send + Sync + 'static) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Replaces the leader and notifies listeners once. Returns false if
    /// the leader didn't change or the context was disposed.
    pub(crate) fn set_leader(&self, leader: ClusterNode) -> bool {
        if self.is_disposed() {
            return false;
        }
        {
            let mut current = self.shared.leader.lock().unwrap_or_else(|e| e.into_inner());
            if current.id == leader.id {
                return false;
            }
            *current = leader.clone();
        }
        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(&leader);
        }
        true
    }

    pub(crate) fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::Release);
    }
}
