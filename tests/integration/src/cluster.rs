//! Membership scenarios over the in-memory network.

use std::collections::BTreeSet;

use cinder_cluster::{ClusterEventKind, ClusterNodeId, GossipHandle};

use crate::helpers::{await_size, start_cluster, within, Network};

fn coordinator_of(handle: &GossipHandle) -> Option<ClusterNodeId> {
    let gossip = handle.gossip();
    gossip.coordinator(&handle.local_id()).map(|n| n.id)
}

#[tokio::test]
async fn three_nodes_converge() {
    let network = Network::new();
    let nodes = start_cluster(&network, 7100, 3).await;

    let topologies: Vec<_> = nodes.iter().map(|(_, h)| h.topology()).collect();
    let hash = topologies[0].hash();
    assert!(topologies.iter().all(|t| t.hash() == hash));

    let orders: BTreeSet<u32> = topologies[0].nodes().iter().map(|n| n.join_order).collect();
    assert_eq!(orders.len(), 3, "join orders must be unique: {orders:?}");

    // the bootstrap node is the oldest member and coordinates
    let first = nodes[0].0.id;
    assert_eq!(topologies[0].oldest().map(|n| n.id), Some(first));
    for (_, handle) in &nodes {
        assert_eq!(coordinator_of(handle), Some(first));
    }

    for (_, handle) in nodes {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn graceful_leave() {
    let network = Network::new();
    let mut nodes = start_cluster(&network, 7200, 3).await;
    let (leaver_node, mut leaver) = nodes.pop().unwrap();
    let mut events = leaver.take_events().unwrap();

    within("leave", leaver.leave()).await.unwrap();
    let left = within("leave event", async {
        loop {
            let event = events.recv().await.expect("event stream closed early");
            if event.kind == ClusterEventKind::Leave {
                return event;
            }
        }
    })
    .await;
    assert!(!left.topology.is_joined());

    for (_, handle) in &nodes {
        let topology = await_size(handle, 2).await;
        assert!(!topology.contains(&leaver_node.id));
    }

    leaver.shutdown().await;
    for (_, handle) in nodes {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn crashed_node_is_removed() {
    let network = Network::new();
    let mut nodes = start_cluster(&network, 7300, 3).await;
    let (crashed, handle) = nodes.pop().unwrap();

    network.detach(crashed.address);
    handle.shutdown().await;

    for (_, handle) in &nodes {
        let topology = await_size(handle, 2).await;
        assert!(!topology.contains(&crashed.id));
    }
    for (_, handle) in nodes {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn coordinator_crash_hands_over() {
    let network = Network::new();
    let mut nodes = start_cluster(&network, 7400, 3).await;
    let (coordinator, handle) = nodes.remove(0);
    assert_eq!(coordinator_of(&nodes[0].1), Some(coordinator.id));

    network.detach(coordinator.address);
    handle.shutdown().await;

    for (_, handle) in &nodes {
        await_size(handle, 2).await;
    }
    // the next oldest member takes over
    let next = nodes[0].1.topology().oldest().map(|n| n.id);
    assert!(next.is_some());
    for (_, handle) in &nodes {
        assert_eq!(coordinator_of(handle), next);
    }
    for (_, handle) in nodes {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn late_joiner_uses_any_seed() {
    let network = Network::new();
    let mut nodes = start_cluster(&network, 7500, 2).await;

    // seeded only with the second node
    nodes.push(network.spawn_node(7502, &[7501]));
    for (_, handle) in &nodes {
        await_size(handle, 3).await;
    }
    let joined = nodes[2].1.topology();
    assert_eq!(joined.local_node().map(|n| n.join_order), Some(3));

    for (_, handle) in nodes {
        handle.shutdown().await;
    }
}
