//! Cluster Integration Tests
//!
//! Run real cluster managers on loopback: gossip membership over UDP,
//! replication over TCP, ownership resolution on every accepted view.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::timeout;

use indexrelay::backend::MemoryIndexBackend;
use indexrelay::cluster::{
    ClusterConfig, ClusterManager, FirstMemberSelector, NodeStatus, Ownership, OwnershipResolver,
    ReplicationListener, ReplicationTransport, SendError, SendMode,
};
use indexrelay::work::{WorkItem, WorkQueue};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(27100);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

struct Node {
    manager: ClusterManager,
    resolver: Arc<OwnershipResolver>,
    backend: Arc<MemoryIndexBackend>,
}

fn node_config(node_id: &str, gossip_port: u16, seeds: Vec<String>) -> ClusterConfig {
    ClusterConfig {
        enabled: true,
        node_id: Some(node_id.to_string()),
        gossip_addr: SocketAddr::from(([127, 0, 0, 1], gossip_port)),
        peer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        seeds,
        gossip_interval: Duration::from_millis(100),
        failure_timeout: Duration::from_secs(2),
        ..ClusterConfig::default()
    }
}

async fn start_node(node_id: &str, gossip_port: u16, seeds: Vec<String>) -> Node {
    let resolver = Arc::new(OwnershipResolver::new(node_id, Box::new(FirstMemberSelector)));
    let backend = Arc::new(MemoryIndexBackend::new(["books"]));
    let listener = Arc::new(ReplicationListener::new(resolver.clone(), backend.clone()));

    let manager = ClusterManager::new(node_config(node_id, gossip_port, seeds), listener)
        .await
        .unwrap();
    manager.start().unwrap();

    Node {
        manager,
        resolver,
        backend,
    }
}

/// Wait until every node sees `members` alive members and is connected to
/// all the others
async fn converge(nodes: &[&Node], members: usize) {
    timeout(Duration::from_secs(20), async {
        loop {
            let done = nodes.iter().all(|n| {
                let resolved = n
                    .resolver
                    .current_view()
                    .map(|v| v.alive().count() == members)
                    .unwrap_or(false);
                n.manager.current_view().alive().count() == members
                    && resolved
                    && n.manager.connected_peer_count() == members - 1
            });
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("cluster did not converge");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_owns_everything() {
    let node = start_node("solo", next_port(), Vec::new()).await;
    converge(&[&node], 1).await;

    assert_eq!(node.resolver.ownership("books"), Ownership::Local);
    assert_eq!(node.manager.local_address().node_id, "solo");

    // No other member: a synchronous send has nobody to wait for
    let queue = WorkQueue::new().with(WorkItem::add("1", b"x".to_vec()));
    let result = node
        .manager
        .send(
            "books",
            &queue,
            SendMode::Sync {
                timeout: Duration::from_secs(1),
            },
        )
        .await;
    assert_eq!(result, Ok(()));

    node.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_work_is_replicated_to_owner() {
    let seed_port = next_port();
    let a = start_node("node-a", seed_port, Vec::new()).await;
    let b = start_node("node-b", next_port(), vec![format!("127.0.0.1:{}", seed_port)]).await;
    converge(&[&a, &b], 2).await;

    // First member in node id order owns every index
    assert_eq!(a.resolver.ownership("books"), Ownership::Local);
    match b.resolver.ownership("books") {
        Ownership::Remote(owner) => assert_eq!(owner.node_id, "node-a"),
        other => panic!("expected remote owner, got {:?}", other),
    }

    let queue = WorkQueue::new()
        .with(WorkItem::add("42", b"title=dune".to_vec()))
        .with(WorkItem::update("42", b"title=dune messiah".to_vec()));
    b.manager
        .send(
            "books",
            &queue,
            SendMode::Sync {
                timeout: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        a.backend.get("books", None, "42"),
        Some(b"title=dune messiah".to_vec())
    );
    assert!(b.backend.applied().is_empty());

    // Work sent by the owner reaches the non-owner, which ignores it
    a.manager
        .send(
            "books",
            &WorkQueue::new().with(WorkItem::delete("42")),
            SendMode::Sync {
                timeout: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();
    assert!(b.backend.applied().is_empty());
    assert_eq!(a.backend.document_count("books", None), 1);

    b.manager.stop().await;
    a.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_index_is_dropped_not_failed() {
    let seed_port = next_port();
    let a = start_node("node-a", seed_port, Vec::new()).await;
    let b = start_node("node-b", next_port(), vec![format!("127.0.0.1:{}", seed_port)]).await;
    converge(&[&a, &b], 2).await;

    let queue = WorkQueue::new().with(WorkItem::add("1", b"x".to_vec()));
    let result = b
        .manager
        .send(
            "music",
            &queue,
            SendMode::Sync {
                timeout: Duration::from_secs(5),
            },
        )
        .await;
    assert_eq!(result, Ok(()));
    assert!(a.backend.applied().is_empty());

    b.manager.stop().await;
    a.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departure_is_gossiped() {
    let seed_port = next_port();
    let a = start_node("node-a", seed_port, Vec::new()).await;
    let b = start_node("node-b", next_port(), vec![format!("127.0.0.1:{}", seed_port)]).await;
    converge(&[&a, &b], 2).await;

    a.manager.stop().await;

    // node-b takes over every index once node-a is no longer alive
    timeout(Duration::from_secs(20), async {
        loop {
            let view = b.manager.current_view();
            let gone = view
                .node("node-a")
                .map(|n| n.status != NodeStatus::Alive)
                .unwrap_or(true);
            if gone && b.resolver.is_owner_local("books") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("departure was not observed");

    b.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_is_idempotent() {
    let node = start_node("solo", next_port(), Vec::new()).await;
    node.manager.stop().await;
    node.manager.stop().await;

    let result = node
        .manager
        .send("books", &WorkQueue::new(), SendMode::Async)
        .await;
    assert_eq!(result, Err(SendError::Stopped));
}
