//! Test harness: in-memory gossip network and a shared lock manager.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cinder_cluster::{
    ClusterConfig, ClusterNode, ClusterNodeId, ClusterTopology, Envelope, GossipDriver,
    GossipHandle, RendezvousPartitionMapper,
};
use cinder_coord::lock::{
    LockOwnerResponse, LockOwnerResponseStatus, LockProtocol, LockProtocolReply, LockRequest,
    LockResponse, LockResponseStatus, UnlockRequest, UnlockResponse, UnlockResponseStatus,
};
use cinder_coord::{CoordConfig, CoordError, LockChannel, LockConfig, LockOwner, LockRegion};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Installs a test-writer subscriber once. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cinder_cluster=info,cinder_coord=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Awaits `fut`, failing the test after [`WAIT`].
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Gossip settings fast enough for tests.
pub fn fast_config(seeds: Vec<SocketAddr>) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.cluster_name = "cinder-test".into();
    config.gossip.gossip_interval_ms = 20;
    config.gossip.seed_retry_interval_ms = 50;
    config.failure_detector.heartbeat_loss_threshold = 3;
    config.failure_detector.failure_quorum = 2;
    config.seed_nodes = seeds;
    config
}

/// Routes envelopes between nodes by address. Delivery is lossy: a full or
/// closed inbox drops the message, like a datagram to a dead host.
#[derive(Clone, Default)]
pub struct Network {
    inboxes: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Envelope>>>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr` and returns the channels for its gossip driver.
    fn attach(&self, addr: SocketAddr) -> (mpsc::Receiver<Envelope>, mpsc::Sender<Envelope>) {
        let (in_tx, in_rx) = mpsc::channel(1024);
        self.inboxes.lock().unwrap().insert(addr, in_tx);

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(1024);
        let inboxes = Arc::clone(&self.inboxes);
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let inbox = inboxes.lock().unwrap().get(&envelope.to).cloned();
                if let Some(inbox) = inbox {
                    let _ = inbox.try_send(envelope);
                }
            }
        });
        (in_rx, out_tx)
    }

    /// Stops delivering to `addr`.
    pub fn detach(&self, addr: SocketAddr) {
        self.inboxes.lock().unwrap().remove(&addr);
    }

    /// Spawns a gossip node on `port` that joins through `seeds`.
    pub fn spawn_node(&self, port: u16, seeds: &[u16]) -> (ClusterNode, GossipHandle) {
        let node = ClusterNode::new(ClusterNodeId::new(), addr(port));
        let config = fast_config(seeds.iter().copied().map(addr).collect());
        let (inbound, outbound) = self.attach(node.address);
        let handle = GossipDriver::new(node.clone(), config)
            .spawn(inbound, outbound)
            .unwrap();
        (node, handle)
    }
}

/// Waits until `handle` sees exactly `size` joined members.
pub async fn await_size(handle: &GossipHandle, size: usize) -> ClusterTopology {
    within(
        &format!("{size} joined members"),
        handle.await_topology(|t| t.size() == size && t.nodes().iter().all(ClusterNode::is_joined)),
    )
    .await
    .unwrap()
}

/// Starts `count` nodes on consecutive ports. The first node bootstraps the
/// cluster; the rest are started once it is up.
pub async fn start_cluster(
    network: &Network,
    first_port: u16,
    count: u16,
) -> Vec<(ClusterNode, GossipHandle)> {
    init_tracing();
    let mut nodes = vec![network.spawn_node(first_port, &[first_port])];
    within("bootstrap", nodes[0].1.await_joined()).await.unwrap();

    for port in first_port + 1..first_port + count {
        nodes.push(network.spawn_node(port, &[first_port]));
    }
    for (_, handle) in &nodes {
        await_size(handle, count as usize).await;
    }
    nodes
}

enum Waiter {
    Blocking(LockRequest, oneshot::Sender<LockResponse>),
    Feedback(LockRequest, mpsc::Sender<LockResponse>),
}

impl Waiter {
    fn request(&self) -> &LockRequest {
        match self {
            Waiter::Blocking(r, _) | Waiter::Feedback(r, _) => r,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    held: HashMap<String, LockRequest>,
    queues: HashMap<String, VecDeque<Waiter>>,
}

/// One lock manager shared by every node of a test cluster. Replies echo
/// the caller's topology hash so they are never considered stale.
#[derive(Default)]
pub struct LockManagerStub {
    nodes: Mutex<HashMap<ClusterNodeId, ClusterNode>>,
    state: Mutex<ManagerState>,
}

fn key(region: &str, name: &str) -> String {
    format!("{region}/{name}")
}

impl LockManagerStub {
    pub fn new(nodes: impl IntoIterator<Item = ClusterNode>) -> Arc<Self> {
        let stub = Self::default();
        stub.nodes
            .lock()
            .unwrap()
            .extend(nodes.into_iter().map(|n| (n.id, n)));
        Arc::new(stub)
    }

    fn owner(&self, request: &LockRequest) -> LockOwner {
        let node = self
            .nodes
            .lock()
            .unwrap()
            .get(&request.node)
            .cloned()
            .unwrap_or_else(|| ClusterNode::new(request.node, addr(0)));
        LockOwner {
            node,
            thread_id: request.thread_id,
        }
    }

    fn reply(request: &LockRequest, status: LockResponseStatus, owner: Option<LockOwner>) -> LockResponse {
        LockResponse {
            status,
            owner,
            topology: request.topology,
        }
    }

    /// Grants the lock, or returns the current owner.
    fn try_grant(&self, state: &mut ManagerState, request: &LockRequest) -> Result<(), LockOwner> {
        let key = key(&request.region, &request.name);
        match state.held.get(&key) {
            Some(current) if current.lock_id != request.lock_id => Err(self.owner(current)),
            _ => {
                state.held.insert(key, request.clone());
                Ok(())
            }
        }
    }

    fn unlock(&self, request: &UnlockRequest) {
        let key = key(&request.region, &request.name);
        let mut state = self.state.lock().unwrap();
        let ManagerState { held, queues } = &mut *state;
        let queue = queues.entry(key.clone()).or_default();
        queue.retain(|w| w.request().lock_id != request.lock_id);
        if held.get(&key).map(|r| r.lock_id) != Some(request.lock_id) {
            return;
        }
        held.remove(&key);

        let Some(next) = queue.pop_front() else {
            return;
        };
        let granted = next.request().clone();
        match next {
            Waiter::Blocking(r, tx) => {
                let _ = tx.send(Self::reply(&r, LockResponseStatus::Ok, None));
            }
            Waiter::Feedback(r, tx) => {
                let _ = tx.try_send(Self::reply(&r, LockResponseStatus::Ok, None));
            }
        }
        let owner = self.owner(&granted);
        held.insert(key, granted);
        for waiter in queue.iter() {
            if let Waiter::Feedback(r, tx) = waiter {
                let _ = tx.try_send(Self::reply(
                    r,
                    LockResponseStatus::LockOwnerChange,
                    Some(owner.clone()),
                ));
            }
        }
    }

    fn enqueue(&self, waiter: Waiter) {
        let request = waiter.request();
        let key = key(&request.region, &request.name);
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(key)
            .or_default()
            .push_back(waiter);
    }
}

#[async_trait]
impl LockChannel for LockManagerStub {
    async fn request(
        &self,
        _manager: &ClusterNode,
        request: LockProtocol,
    ) -> Result<LockProtocolReply, CoordError> {
        match request {
            LockProtocol::Lock(request) => {
                let granted = {
                    let mut state = self.state.lock().unwrap();
                    self.try_grant(&mut state, &request)
                };
                let reply = match granted {
                    Ok(()) => Self::reply(&request, LockResponseStatus::Ok, None),
                    Err(owner) if request.timeout == Some(Duration::ZERO) => {
                        Self::reply(&request, LockResponseStatus::LockBusy, Some(owner))
                    }
                    Err(_) => {
                        let (tx, rx) = oneshot::channel();
                        self.enqueue(Waiter::Blocking(request, tx));
                        rx.await
                            .map_err(|_| CoordError::Channel("manager dropped request".into()))?
                    }
                };
                Ok(LockProtocolReply::Lock(reply))
            }
            LockProtocol::Unlock(request) => {
                self.unlock(&request);
                Ok(LockProtocolReply::Unlock(UnlockResponse {
                    status: UnlockResponseStatus::Ok,
                    topology: request.topology,
                }))
            }
            LockProtocol::Owner(request) => {
                let owner = {
                    let state = self.state.lock().unwrap();
                    state.held.get(&key(&request.region, &request.name)).cloned()
                };
                Ok(LockProtocolReply::Owner(LockOwnerResponse {
                    status: LockOwnerResponseStatus::Ok,
                    owner: owner.map(|r| self.owner(&r)),
                    topology: request.topology,
                }))
            }
        }
    }

    async fn subscribe(
        &self,
        _manager: &ClusterNode,
        request: LockRequest,
    ) -> Result<mpsc::Receiver<LockResponse>, CoordError> {
        let (tx, rx) = mpsc::channel(16);
        let granted = {
            let mut state = self.state.lock().unwrap();
            self.try_grant(&mut state, &request)
        };
        match granted {
            Ok(()) => {
                let _ = tx.try_send(Self::reply(&request, LockResponseStatus::Ok, None));
            }
            Err(owner) => {
                let _ = tx.try_send(Self::reply(&request, LockResponseStatus::LockBusy, Some(owner)));
                self.enqueue(Waiter::Feedback(request, tx));
            }
        }
        Ok(rx)
    }
}

/// A lock region on `node` that follows the node's gossip topology.
pub fn region_for(
    name: &str,
    node: &ClusterNode,
    gossip: &GossipHandle,
    manager: Arc<LockManagerStub>,
) -> (Arc<LockRegion>, JoinHandle<()>) {
    let config = LockConfig {
        retry_interval_ms: 10,
        max_retries: None,
    };
    let region = LockRegion::new(
        name,
        node.id,
        manager,
        Arc::new(RendezvousPartitionMapper::default()),
        &config,
    );
    region.update_topology(gossip.topology());
    let follower = region.follow(gossip.subscribe());
    (region, follower)
}

/// The election region on `node`, built from a default [`CoordConfig`]
/// with a short retry interval.
pub fn election_region_for(
    node: &ClusterNode,
    gossip: &GossipHandle,
    manager: Arc<LockManagerStub>,
) -> (Arc<LockRegion>, JoinHandle<()>) {
    let mut config = CoordConfig::default();
    config.lock.retry_interval_ms = 10;
    config.lock.max_retries = None;
    let region = LockRegion::for_elections(
        node.id,
        manager,
        Arc::new(RendezvousPartitionMapper::default()),
        &config,
    );
    region.update_topology(gossip.topology());
    let follower = region.follow(gossip.subscribe());
    (region, follower)
}
