//! End-to-end coverage of a real 3-node cluster talking over TCP: leader failover (S1), lock
//! fairness and deadlock resolution (S2/S3), produce/consume/ack (S4), and cache coherence
//! across nodes (S5). Exercises the same [`distsync::DistSyncNode`] surface a real deployment
//! would use, just bound to localhost.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use distsync::CacheState;
use distsync::ClusterMember;
use distsync::Config;
use distsync::DistSyncNode;
use distsync::InMemoryStore;
use distsync::LockMode;

/// Installs a process-wide `tracing` subscriber on first use so a failing test's spans and
/// events show up on stderr; harmless (and a no-op) on every subsequent call.
fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default().with(tracing_subscriber::EnvFilter::from_default_env()).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn test_config(node_id: u64, base_port: u16, ids_ports: &[(u64, u16)]) -> Config {
    let cluster_nodes = ids_ports
        .iter()
        .map(|&(id, port)| ClusterMember {
            id,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        })
        .collect();
    Config {
        node_id,
        node_host: "127.0.0.1".to_string(),
        node_port: base_port,
        cluster_nodes,
        heartbeat_interval: 50,
        election_timeout_min: 300,
        election_timeout_max: 500,
        queue_partitions: 4,
        queue_virtual_nodes: 32,
        visibility_timeout: 300,
        message_persistence: true,
        message_ttl: 60,
        cache_size_mb: 16,
        request_timeout: 1_000,
    }
}

async fn start_cluster(base_port: u16) -> Vec<Arc<DistSyncNode<InMemoryStore>>> {
    let ids_ports: Vec<(u64, u16)> = vec![(1, base_port), (2, base_port + 1), (3, base_port + 2)];
    let mut nodes = Vec::new();
    for &(id, port) in &ids_ports {
        let config = test_config(id, port, &ids_ports);
        let node = DistSyncNode::start(config, Arc::new(InMemoryStore::new())).await.unwrap();
        nodes.push(node);
    }
    // Give the transport listeners a moment to bind before anyone dials in.
    tokio::time::sleep(Duration::from_millis(100)).await;
    nodes
}

async fn wait_for_leader(nodes: &[Arc<DistSyncNode<InMemoryStore>>]) -> Arc<DistSyncNode<InMemoryStore>> {
    for _ in 0..100 {
        for node in nodes {
            if node.metrics().borrow().state.is_leader() {
                return node.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no leader elected within deadline");
}

#[tokio::test]
async fn leader_failover_elects_a_new_leader_and_old_leader_stops_serving() {
    init_tracing();
    let nodes = start_cluster(23_000).await;
    let first_leader = wait_for_leader(&nodes).await;

    first_leader.shutdown().await.unwrap();

    let remaining: Vec<_> = nodes.iter().filter(|n| n.node_id() != first_leader.node_id()).cloned().collect();
    let second_leader = wait_for_leader(&remaining).await;
    assert_ne!(second_leader.node_id(), first_leader.node_id());

    // The old leader's core task has exited: it can no longer drive a proposal to completion.
    let result = first_leader.acquire("R", LockMode::Exclusive, "c1", Duration::from_millis(200)).await;
    assert!(result.is_err(), "shut-down former leader should not be able to serve requests, got {:?}", result);

    // The new leader still serves client requests normally.
    second_leader.acquire("R", LockMode::Exclusive, "c1", Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn exclusive_lock_excludes_concurrent_acquirer_until_release() {
    init_tracing();
    let nodes = start_cluster(23_100).await;
    let leader = wait_for_leader(&nodes).await;

    leader.acquire("R", LockMode::Exclusive, "c1", Duration::from_secs(1)).await.unwrap();

    let second = leader.acquire("R", LockMode::Exclusive, "c2", Duration::from_millis(200)).await;
    assert!(matches!(second, Err(distsync::DistSyncError::Timeout)));

    leader.release("R", "c1").await.unwrap();
    leader.acquire("R", LockMode::Exclusive, "c2", Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn deadlock_between_two_clients_resolves_to_exactly_one_victim() {
    init_tracing();
    let nodes = start_cluster(23_200).await;
    let leader = wait_for_leader(&nodes).await;

    leader.acquire("R1", LockMode::Exclusive, "c1", Duration::from_secs(1)).await.unwrap();
    leader.acquire("R2", LockMode::Exclusive, "c2", Duration::from_secs(1)).await.unwrap();

    let leader2 = leader.clone();
    let a = tokio::spawn(async move { leader2.acquire("R2", LockMode::Exclusive, "c1", Duration::from_secs(2)).await });
    let leader3 = leader.clone();
    let b = tokio::spawn(async move { leader3.acquire("R1", LockMode::Exclusive, "c2", Duration::from_secs(2)).await });

    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
    let aborted = [&ra, &rb].into_iter().filter(|r| matches!(r, Err(distsync::DistSyncError::AbortedDeadlock))).count();
    assert_eq!(aborted, 1, "expected exactly one side of the cycle to be aborted, got {:?} / {:?}", ra, rb);
}

#[tokio::test]
async fn cache_write_on_one_node_invalidates_and_is_visible_on_another() {
    init_tracing();
    let nodes = start_cluster(23_300).await;
    let leader = wait_for_leader(&nodes).await;
    // Cache writes (like every other proposal) must go through whichever node is actually
    // leader; a non-leader reader stands in for the "another node" side of S5.
    let reader = nodes.iter().find(|n| n.node_id() != leader.node_id()).unwrap();

    leader.cache_write("K", b"1".to_vec()).await.unwrap();

    let mut seen = None;
    for _ in 0..50 {
        if let Ok(v) = reader.cache_read("K").await {
            seen = Some(v);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(seen, Some(b"1".to_vec()));

    leader.cache_write("K", b"2".to_vec()).await.unwrap();

    let mut seen_again = None;
    for _ in 0..50 {
        if let Ok(v) = reader.cache_read("K").await {
            seen_again = Some(v);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(seen_again, Some(b"2".to_vec()));
}

/// S5's coherence invariant (property 8): at most one node may hold a key Modified, and it must
/// hold none while any other node holds it Shared/Exclusive. A remote read of a Modified line
/// must write it back and downgrade the writer to Shared, not just hand the reader a Shared copy
/// while the writer stays Modified.
#[tokio::test]
async fn remote_read_downgrades_modified_writer_to_shared() {
    init_tracing();
    let nodes = start_cluster(23_350).await;
    let leader = wait_for_leader(&nodes).await;
    let reader = nodes.iter().find(|n| n.node_id() != leader.node_id()).unwrap();

    leader.cache_write("K", b"1".to_vec()).await.unwrap();
    assert_eq!(leader.local_cache_state("K").await, Some(CacheState::Modified));

    let mut seen = None;
    for _ in 0..50 {
        if let Ok(v) = reader.cache_read("K").await {
            seen = Some(v);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(seen, Some(b"1".to_vec()));
    assert_eq!(reader.local_cache_state("K").await, Some(CacheState::Shared));

    // Give the leader's downgrade proposal time to commit and apply before asserting on it.
    let mut leader_state = None;
    for _ in 0..50 {
        leader_state = leader.local_cache_state("K").await;
        if leader_state == Some(CacheState::Shared) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(leader_state, Some(CacheState::Shared), "writer must downgrade to Shared once another node reads its Modified line");
}

#[tokio::test]
async fn produce_consume_ack_round_trip() {
    init_tracing();
    let nodes = start_cluster(23_400).await;
    let leader = wait_for_leader(&nodes).await;

    let message_id = leader.produce(b"payload".to_vec(), Some("k")).await.unwrap();
    let partition = distsync::partition_for(Some("k"), 0, 4);

    let received = leader.consume(partition, "consumer-x", Duration::from_secs(1)).await.unwrap();
    let received = received.expect("expected a message within the deadline");
    assert_eq!(received.message_id, message_id);

    leader.ack("consumer-x", &received.message_id).await.unwrap();
}
