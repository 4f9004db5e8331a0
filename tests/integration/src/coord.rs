//! Locks and elections across a gossiping cluster.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinder_cluster::{ClusterNode, ClusterNodeId, GossipHandle};
use cinder_coord::{
    Candidate, DistributedLock, ElectionHandle, ElectionWorker, FollowerContext, LeaderContext,
    LockRegion,
};
use tokio::task::JoinHandle;

use crate::helpers::{
    election_region_for, region_for, start_cluster, within, LockManagerStub, Network,
};

struct Node {
    node: ClusterNode,
    gossip: GossipHandle,
    region: Arc<LockRegion>,
    elections: Arc<LockRegion>,
    followers: [JoinHandle<()>; 2],
}

async fn coord_cluster(first_port: u16, count: u16) -> Vec<Node> {
    let network = Network::new();
    let nodes = start_cluster(&network, first_port, count).await;
    let manager = LockManagerStub::new(nodes.iter().map(|(n, _)| n.clone()));
    nodes
        .into_iter()
        .map(|(node, gossip)| {
            let (region, jobs) = region_for("jobs", &node, &gossip, Arc::clone(&manager));
            let (elections, leaders) = election_region_for(&node, &gossip, Arc::clone(&manager));
            Node {
                node,
                gossip,
                region,
                elections,
                followers: [jobs, leaders],
            }
        })
        .collect()
}

async fn stop(nodes: Vec<Node>) {
    for node in nodes {
        node.region.terminate();
        node.elections.terminate();
        for follower in node.followers {
            follower.abort();
        }
        node.gossip.shutdown().await;
    }
}

#[tokio::test]
async fn locks_are_exclusive_across_nodes() {
    let nodes = coord_cluster(7600, 3).await;
    let first = nodes[0].region.get("invoice-42");
    let second = Arc::new(nodes[1].region.get("invoice-42"));

    within("first lock", first.lock()).await.unwrap();
    assert!(first.is_held());
    assert!(!within("try_lock", second.try_lock()).await.unwrap());

    let waiter = {
        let second = Arc::clone(&second);
        tokio::spawn(async move { second.lock().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_held());

    within("unlock", first.unlock()).await.unwrap();
    within("second lock", waiter).await.unwrap().unwrap();
    assert!(second.is_held());

    // the lock manager is the same for every node once topologies agree
    let managers: Vec<_> = nodes
        .iter()
        .map(|n| n.region.manager_of("invoice-42").map(|m| m.id))
        .collect();
    assert!(managers[0].is_some());
    assert!(managers.iter().all(|m| *m == managers[0]));

    within("second unlock", second.unlock()).await.unwrap();
    stop(nodes).await;
}

/// Records leadership changes.
#[derive(Clone, Default)]
struct Recorder {
    leading: Arc<Mutex<Option<LeaderContext>>>,
    followed: Arc<Mutex<Vec<ClusterNodeId>>>,
}

impl Candidate for Recorder {
    fn become_leader(&mut self, ctx: LeaderContext) {
        *self.leading.lock().unwrap() = Some(ctx);
    }

    fn become_follower(&mut self, ctx: FollowerContext) {
        self.followed.lock().unwrap().push(ctx.leader().id);
    }

    fn terminate(&mut self) {
        self.leading.lock().unwrap().take();
    }
}

struct Election {
    node: ClusterNode,
    handle: ElectionHandle,
    candidate: Recorder,
}

fn elect(nodes: &[Node]) -> Vec<Election> {
    nodes
        .iter()
        .map(|n| {
            let candidate = Recorder::default();
            let lock: Arc<dyn DistributedLock> = Arc::new(n.elections.get("scheduler"));
            let handle =
                ElectionWorker::spawn("scheduler", n.node.clone(), candidate.clone(), lock);
            Election {
                node: n.node.clone(),
                handle,
                candidate,
            }
        })
        .collect()
}

/// Waits until every election agrees on one leader and returns its index.
async fn agreed_leader(elections: &[Election]) -> usize {
    let mut leaders = Vec::new();
    for e in elections {
        leaders.push(within("leader", e.handle.leader()).await.unwrap().id);
    }
    assert!(
        leaders.iter().all(|id| *id == leaders[0]),
        "nodes disagree on the leader: {leaders:?}"
    );
    elections
        .iter()
        .position(|e| e.node.id == leaders[0])
        .expect("leader is not a candidate")
}

#[tokio::test]
async fn one_leader_is_elected() {
    let nodes = coord_cluster(7700, 3).await;
    let elections = elect(&nodes);

    let leader = agreed_leader(&elections).await;
    for (i, e) in elections.iter().enumerate() {
        assert_eq!(e.handle.is_leader().await.unwrap(), i == leader);
        assert_eq!(e.candidate.leading.lock().unwrap().is_some(), i == leader);
    }

    for e in elections {
        e.handle.terminate().await.unwrap();
    }
    stop(nodes).await;
}

#[tokio::test]
async fn yielding_hands_leadership_over() {
    let nodes = coord_cluster(7800, 3).await;
    let elections = elect(&nodes);
    let old = agreed_leader(&elections).await;

    let (a, b, c, ()) = tokio::join!(
        elections[0].handle.next_leader(),
        elections[1].handle.next_leader(),
        elections[2].handle.next_leader(),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            elections[old].handle.yield_leadership().await.unwrap();
        }
    );
    let next: Vec<_> = [a, b, c].into_iter().map(|l| l.unwrap().id).collect();
    assert!(next.iter().all(|id| *id == next[0]), "{next:?}");
    assert_ne!(next[0], elections[old].node.id);

    // the old leader queued again and now follows
    assert!(!elections[old].handle.is_leader().await.unwrap());
    assert_eq!(
        elections[old].candidate.followed.lock().unwrap().last(),
        Some(&next[0])
    );

    for e in elections {
        e.handle.terminate().await.unwrap();
    }
    stop(nodes).await;
}

#[tokio::test]
async fn terminated_leader_releases_the_group() {
    let nodes = coord_cluster(7900, 3).await;
    let mut elections = elect(&nodes);
    let old = agreed_leader(&elections).await;
    let Election {
        node: leaving_node,
        handle: leaving,
        candidate: leaving_candidate,
    } = elections.remove(old);

    let (a, b, stopped) = tokio::join!(
        elections[0].handle.next_leader(),
        elections[1].handle.next_leader(),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            leaving.terminate().await
        }
    );
    stopped.unwrap();
    assert!(leaving_candidate.leading.lock().unwrap().is_none());

    let (a, b) = (a.unwrap().id, b.unwrap().id);
    assert_eq!(a, b);
    assert_ne!(a, leaving_node.id);
    let new_leader = elections.iter().filter(|e| e.node.id == a).count();
    assert_eq!(new_leader, 1);

    for e in elections {
        e.handle.terminate().await.unwrap();
    }
    stop(nodes).await;
}
