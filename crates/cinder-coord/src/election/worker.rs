//! One tokio task per election group.
//!
//! The task owns the group's [`CandidateHandler`], so every leader and
//! follower transition runs on it in arrival order. Callers talk to it
//! through an [`ElectionHandle`].

use std::sync::Arc;

use cinder_cluster::ClusterNode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::handler::{Candidate, CandidateHandler, ElectionEvent, LeaderFuture};
use crate::lock::DistributedLock;
use crate::CoordError;

enum Request {
    Leader(oneshot::Sender<LeaderFuture>),
    NextLeader(oneshot::Sender<LeaderFuture>),
    IsLeader(oneshot::Sender<bool>),
    Yield,
    Terminate(oneshot::Sender<()>),
}

/// Runs a [`CandidateHandler`] on its own task.
pub struct ElectionWorker<C: Candidate> {
    handler: CandidateHandler<C>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedReceiver<ElectionEvent>,
}

impl<C: Candidate> ElectionWorker<C> {
    /// Starts an election for `group` using `lock` as the group's lock.
    pub fn spawn(
        group: impl Into<String>,
        local: ClusterNode,
        candidate: C,
        lock: Arc<dyn DistributedLock>,
    ) -> ElectionHandle {
        let group = group.into();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (request_tx, requests) = mpsc::channel(32);
        let handler = CandidateHandler::new(group.clone(), local, candidate, lock, event_tx);
        let worker = ElectionWorker {
            handler,
            requests,
            events,
        };
        let task = tokio::spawn(worker.run());
        ElectionHandle {
            group,
            requests: request_tx,
            task,
        }
    }

    async fn run(mut self) {
        self.handler.start();
        loop {
            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.apply(request) {
                            break;
                        }
                    }
                    None => {
                        debug!("election {}: all handles dropped", self.handler.group());
                        let _ = self.handler.terminate();
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handler.handle(event),
            }
        }
    }

    /// Returns false when the worker should stop.
    fn apply(&mut self, request: Request) -> bool {
        match request {
            Request::Leader(reply) => {
                let _ = reply.send(self.handler.leader_future());
            }
            Request::NextLeader(reply) => {
                let _ = reply.send(self.handler.next_leader());
            }
            Request::IsLeader(reply) => {
                let _ = reply.send(self.handler.is_leader());
            }
            Request::Yield => self.handler.yield_leadership(),
            Request::Terminate(done) => {
                let _ = self.handler.terminate();
                let _ = done.send(());
                return false;
            }
        }
        true
    }
}

/// Caller side of a running election.
#[derive(Debug)]
pub struct ElectionHandle {
    group: String,
    requests: mpsc::Sender<Request>,
    task: JoinHandle<()>,
}

impl ElectionHandle {
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn ask<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, CoordError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| CoordError::Terminated)?;
        rx.await.map_err(|_| CoordError::Terminated)
    }

    /// The current leader, or the first one elected.
    pub async fn leader(&self) -> Result<ClusterNode, CoordError> {
        self.ask(Request::Leader).await?.await
    }

    /// Waits for the next leadership change.
    pub async fn next_leader(&self) -> Result<ClusterNode, CoordError> {
        self.ask(Request::NextLeader).await?.await
    }

    pub async fn is_leader(&self) -> Result<bool, CoordError> {
        self.ask(Request::IsLeader).await
    }

    /// Gives up leadership if this node holds it.
    pub async fn yield_leadership(&self) -> Result<(), CoordError> {
        self.requests
            .send(Request::Yield)
            .await
            .map_err(|_| CoordError::Terminated)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the election and waits for the worker to exit. The group's
    /// lock is released in the background.
    pub async fn terminate(self) -> Result<(), CoordError> {
        self.ask(Request::Terminate).await?;
        self.task.await.map_err(|_| CoordError::Terminated)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::Leader(_) => "Leader",
            Request::NextLeader(_) => "NextLeader",
            Request::IsLeader(_) => "IsLeader",
            Request::Yield => "Yield",
            Request::Terminate(_) => "Terminate",
        };
        f.write_str(name)
    }
}
