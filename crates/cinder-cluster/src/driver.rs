//! Tokio task running a [`GossipManager`].
//!
//! The driver owns the manager on a single task, so the gossip view has
//! exactly one writer. It ticks the manager on an interval, feeds it the
//! messages arriving on the inbound channel and pushes replies to the
//! outbound channel. Encoding and delivery are the transport's job.
//!
//! Callers observe membership through the returned [`GossipHandle`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::failure::{DefaultFailureDetector, FailureDetector};
use crate::gossip::Gossip;
use crate::manager::{GossipManager, Outgoing};
use crate::message::Envelope;
use crate::seeds::{SeedNodeProvider, StaticSeedNodeProvider};
use crate::topology::{ClusterEvent, ClusterTopology};
use crate::{ClusterError, ClusterNode, ClusterNodeId};

/// Capacity of the cluster event channel.
const EVENT_BUFFER: usize = 256;

/// Builder for a gossip task.
pub struct GossipDriver {
    local: ClusterNode,
    config: ClusterConfig,
    seed_provider: Arc<dyn SeedNodeProvider>,
    detector: Option<Box<dyn FailureDetector>>,
}

impl std::fmt::Debug for GossipDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipDriver")
            .field("local", &self.local)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GossipDriver {
    /// Creates a driver that joins through `config.seed_nodes`.
    pub fn new(local: ClusterNode, config: ClusterConfig) -> Self {
        let seed_provider = Arc::new(StaticSeedNodeProvider::new(config.seed_nodes.clone()));
        Self {
            local,
            config,
            seed_provider,
            detector: None,
        }
    }

    /// Uses another source of seed addresses.
    pub fn with_seed_provider(mut self, provider: Arc<dyn SeedNodeProvider>) -> Self {
        self.seed_provider = provider;
        self
    }

    /// Replaces the default heartbeat failure detector.
    pub fn with_failure_detector(mut self, detector: Box<dyn FailureDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Starts joining and spawns the gossip task.
    ///
    /// `inbound` carries messages addressed to this node; replies and
    /// periodic gossip go to `outbound`. Must be called from within a tokio
    /// runtime.
    pub fn spawn(
        self,
        inbound: mpsc::Receiver<Envelope>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<GossipHandle, ClusterError> {
        self.config.validate()?;
        let cluster = self.config.cluster_name.clone();
        let seeds = self.seed_provider.seed_nodes(&cluster)?;

        let detector = self.detector.unwrap_or_else(|| {
            Box::new(DefaultFailureDetector::new(
                self.config.failure_detector.clone(),
            ))
        });
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let mut manager = GossipManager::new(self.local, &self.config, detector, event_tx);
        manager.join(seeds);

        let local_id = manager.local_id();
        let (topology_tx, topology_rx) = watch::channel(manager.topology().clone());
        let (gossip_tx, gossip_rx) = watch::channel(manager.gossip());
        let (command_tx, command_rx) = mpsc::channel(16);

        let seed_refresh_interval = self
            .seed_provider
            .cleanup_interval()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| self.config.gossip.seed_cleanup_interval());
        let task = GossipTask {
            manager,
            cluster,
            seed_provider: self.seed_provider,
            inbound,
            outbound,
            commands: command_rx,
            topology_tx,
            gossip_tx,
            gossip_interval: self.config.gossip.gossip_interval(),
            seed_refresh_interval,
            registered: false,
        };
        let join = tokio::spawn(task.run());

        Ok(GossipHandle {
            local_id,
            commands: command_tx,
            topology: topology_rx,
            gossip: gossip_rx,
            events: Some(event_rx),
            task: join,
        })
    }
}

enum Command {
    Leave,
    Unreachable(SocketAddr),
    Shutdown,
}

enum Step {
    Tick,
    Message(Envelope),
    Command(Command),
    RefreshSeeds,
    Stop,
}

struct GossipTask {
    manager: GossipManager,
    cluster: String,
    seed_provider: Arc<dyn SeedNodeProvider>,
    inbound: mpsc::Receiver<Envelope>,
    outbound: mpsc::Sender<Envelope>,
    commands: mpsc::Receiver<Command>,
    topology_tx: watch::Sender<ClusterTopology>,
    gossip_tx: watch::Sender<Arc<Gossip>>,
    gossip_interval: Duration,
    seed_refresh_interval: Duration,
    /// Whether our address is registered with the seed provider.
    registered: bool,
}

impl GossipTask {
    async fn run(mut self) {
        let local = self.manager.local_node().clone();
        info!("gossip started for {}", local);

        let mut ticker = tokio::time::interval(self.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seed_refresh = tokio::time::interval(self.seed_refresh_interval);
        seed_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately and seeds were just loaded
        seed_refresh.tick().await;

        loop {
            let joining = self.manager.is_joining();
            let step = tokio::select! {
                _ = ticker.tick() => Step::Tick,
                msg = self.inbound.recv() => msg.map_or(Step::Stop, Step::Message),
                cmd = self.commands.recv() => cmd.map_or(Step::Stop, Step::Command),
                _ = seed_refresh.tick(), if joining => Step::RefreshSeeds,
            };

            let out = match step {
                Step::Tick => self.manager.tick(),
                Step::Message(envelope) => {
                    if envelope.to != local.address {
                        debug!("dropping {} addressed to {}", envelope.message.kind(), envelope.to);
                        Vec::new()
                    } else {
                        self.manager.handle_message(envelope.message, envelope.from)
                    }
                }
                Step::Command(Command::Leave) => {
                    self.manager.leave();
                    Vec::new()
                }
                Step::Command(Command::Unreachable(addr)) => {
                    self.manager.on_unreachable(addr);
                    Vec::new()
                }
                Step::RefreshSeeds => {
                    self.refresh_seeds();
                    Vec::new()
                }
                Step::Command(Command::Shutdown) | Step::Stop => break,
            };

            if !self.send_all(local.address, out).await {
                break;
            }
            self.publish();

            if self.manager.is_terminated() {
                break;
            }
        }

        self.unregister();
        info!("gossip stopped for {}", local);
    }

    /// Returns false once the transport is gone.
    async fn send_all(&mut self, from: SocketAddr, out: Outgoing) -> bool {
        for (to, message) in out {
            let envelope = Envelope { from, to, message };
            if self.outbound.send(envelope).await.is_err() {
                warn!("gossip outbound channel closed, stopping");
                return false;
            }
        }
        true
    }

    fn publish(&mut self) {
        let topology = self.manager.topology();
        self.topology_tx.send_if_modified(|current| {
            if current != topology {
                *current = topology.clone();
                true
            } else {
                false
            }
        });

        let gossip = self.manager.gossip();
        self.gossip_tx.send_if_modified(|current| {
            if Arc::ptr_eq(current, &gossip) {
                false
            } else {
                *current = gossip;
                true
            }
        });

        if !self.registered && self.manager.topology().is_joined() {
            let addr = self.manager.local_node().address;
            match self.seed_provider.register_address(&self.cluster, addr) {
                Ok(()) => self.registered = true,
                Err(e) => warn!("failed to register {} as seed node: {}", addr, e),
            }
        }
    }

    fn refresh_seeds(&mut self) {
        match self.seed_provider.seed_nodes(&self.cluster) {
            Ok(seeds) => {
                debug!("refreshed {} seed nodes", seeds.len());
                self.manager.update_seeds(seeds);
            }
            Err(e) => warn!("failed to refresh seed nodes: {}", e),
        }
    }

    fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        let addr = self.manager.local_node().address;
        if let Err(e) = self.seed_provider.unregister_address(&self.cluster, addr) {
            warn!("failed to unregister seed node {}: {}", addr, e);
        }
        self.registered = false;
    }
}

/// Handle to a running gossip task.
#[derive(Debug)]
pub struct GossipHandle {
    local_id: ClusterNodeId,
    commands: mpsc::Sender<Command>,
    topology: watch::Receiver<ClusterTopology>,
    gossip: watch::Receiver<Arc<Gossip>>,
    events: Option<mpsc::Receiver<ClusterEvent>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Leave => write!(f, "Leave"),
            Command::Unreachable(addr) => write!(f, "Unreachable({addr})"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl GossipHandle {
    pub fn local_id(&self) -> ClusterNodeId {
        self.local_id
    }

    /// Latest published topology.
    pub fn topology(&self) -> ClusterTopology {
        self.topology.borrow().clone()
    }

    /// Latest gossip view.
    pub fn gossip(&self) -> Arc<Gossip> {
        Arc::clone(&self.gossip.borrow())
    }

    /// Watches topology snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ClusterTopology> {
        self.topology.clone()
    }

    /// Takes the cluster event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClusterEvent>> {
        self.events.take()
    }

    /// Waits until the local node is UP.
    pub async fn await_joined(&self) -> Result<ClusterTopology, ClusterError> {
        self.await_topology(|t| t.local_node().is_some_and(ClusterNode::is_joined))
            .await
    }

    /// Waits for a topology matching `pred`.
    pub async fn await_topology(
        &self,
        pred: impl FnMut(&ClusterTopology) -> bool,
    ) -> Result<ClusterTopology, ClusterError> {
        let mut rx = self.topology.clone();
        let topology = rx
            .wait_for(pred)
            .await
            .map_err(|_| ClusterError::Terminated)?;
        Ok(topology.clone())
    }

    /// Reports that the transport failed to reach `addr`.
    pub async fn report_unreachable(&self, addr: SocketAddr) -> Result<(), ClusterError> {
        self.commands
            .send(Command::Unreachable(addr))
            .await
            .map_err(|_| ClusterError::Terminated)
    }

    /// Leaves the cluster and waits until the local node is out of it.
    pub async fn leave(&self) -> Result<(), ClusterError> {
        self.commands
            .send(Command::Leave)
            .await
            .map_err(|_| ClusterError::Terminated)?;

        let mut rx = self.topology.clone();
        // a closed channel means the task already stopped, which is also out
        let _ = rx.wait_for(|t| !t.is_joined()).await;
        Ok(())
    }

    /// Returns true once the gossip task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the gossip task without leaving gracefully.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("gossip task failed: {}", e);
        }
    }
}
