//! Integration tests for the public `Dht` handle.
//!
//! Every node binds its own loopback UDP socket, so these exercise the real
//! wire format, the actor loop and the timers end to end.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bitdht::{generate_random_id, AnnounceFlags, Dht, DhtSettings, DhtState, NodeId, Value};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Every node sits in 127.0.0.0/24, so subnet rules and the per-IP rate
/// limit are relaxed.
fn test_settings() -> DhtSettings {
    DhtSettings {
        restrict_routing_ips: false,
        restrict_search_ips: false,
        block_ratelimit: 100_000,
        upload_rate_limit: 0,
        query_short_timeout: Duration::from_millis(300),
        query_timeout: Duration::from_secs(1),
        ..DhtSettings::default()
    }
}

/// A fresh loopback IP per node; the routing table keeps one live entry per IP.
fn loopback() -> SocketAddr {
    static NEXT: AtomicU8 = AtomicU8::new(0);
    let host = 2 + NEXT.fetch_add(1, Ordering::Relaxed) % 250;
    SocketAddr::from((Ipv4Addr::new(127, 0, 0, host), 0))
}

async fn spawn_node(settings: DhtSettings) -> Dht {
    Dht::bind(loopback(), settings, None).await.expect("bind failed")
}

/// `count` nodes that have all pinged each other.
async fn swarm(count: usize) -> Vec<Dht> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(spawn_node(test_settings()).await);
    }
    for a in &nodes {
        for b in &nodes {
            if a.local_addr() != b.local_addr() {
                assert!(a.ping(b.local_addr()).await.unwrap(), "ping failed");
            }
        }
    }
    nodes
}

#[tokio::test]
async fn bind_reports_address_and_empty_table() {
    let dht = spawn_node(test_settings()).await;
    assert!(dht.local_addr().port() > 0);

    let status = dht.status().await.unwrap();
    assert!(!status.id.is_all_zeros());
    assert_eq!(status.live_nodes, 0);
    assert_eq!(status.running_traversals, 0);
    assert_eq!(dht.node_id().await.unwrap(), status.id);
}

#[tokio::test]
async fn ping_adds_responder_to_routing_table() {
    let a = spawn_node(test_settings()).await;
    let b = spawn_node(test_settings()).await;

    let answered = timeout(TEST_TIMEOUT, a.ping(b.local_addr())).await.unwrap().unwrap();
    assert!(answered);

    let status = a.status().await.unwrap();
    assert_eq!(status.live_nodes, 1);
    // b only heard from a; it stays unconfirmed until b queries it
    let status = b.status().await.unwrap();
    assert_eq!(status.live_nodes, 0);
    assert_eq!(status.replacement_nodes, 1);
}

#[tokio::test]
async fn ping_to_silent_endpoint_times_out() {
    let a = spawn_node(test_settings()).await;
    // bound but never read from
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

    let answered = timeout(TEST_TIMEOUT, a.ping(silent.local_addr().unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert!(!answered);
}

#[tokio::test]
async fn read_only_node_is_never_answered_to_nor_added() {
    let normal = spawn_node(test_settings()).await;
    let ro = spawn_node(DhtSettings { read_only: true, ..test_settings() }).await;

    // the read-only node can query
    assert!(ro.ping(normal.local_addr()).await.unwrap());
    assert_eq!(ro.status().await.unwrap().live_nodes, 1);

    // but is not added to anyone's table and answers nothing
    let status = normal.status().await.unwrap();
    assert_eq!(status.live_nodes + status.replacement_nodes, 0);
    assert!(!timeout(TEST_TIMEOUT, normal.ping(ro.local_addr())).await.unwrap().unwrap());
}

#[tokio::test]
async fn bootstrap_and_find_node_across_swarm() {
    let nodes = swarm(6).await;

    let newcomer = spawn_node(test_settings()).await;
    let found = timeout(TEST_TIMEOUT, newcomer.bootstrap(vec![nodes[0].local_addr()]))
        .await
        .unwrap()
        .unwrap();
    assert!(!found.is_empty());

    let target = nodes[3].node_id().await.unwrap();
    let closest = timeout(TEST_TIMEOUT, newcomer.find_node(target)).await.unwrap().unwrap();
    assert_eq!(closest.first().map(|(id, _)| *id), Some(target));
    assert_eq!(closest[0].1, nodes[3].local_addr());
    // closest first
    for pair in closest.windows(2) {
        let d0 = bitdht::distance(&pair[0].0, &target);
        let d1 = bitdht::distance(&pair[1].0, &target);
        assert!(d0 <= d1);
    }
}

#[tokio::test]
async fn announce_then_get_peers_and_sample() {
    let nodes = swarm(5).await;
    let info_hash = generate_random_id();

    let flags = AnnounceFlags { port: 7000, implied_port: false, seed: false, name: None };
    let first = timeout(TEST_TIMEOUT, nodes[0].announce(info_hash, flags)).await.unwrap().unwrap();
    assert!(first.peers.is_empty());

    // the announce_peer round runs after the lookup completes
    let expected = SocketAddr::new(nodes[0].local_addr().ip(), 7000);
    let mut peers = Vec::new();
    for _ in 0..50 {
        peers = nodes[4].get_peers(info_hash, false, false).await.unwrap().peers;
        if !peers.is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(peers, vec![expected]);

    let scrape = nodes[2].get_peers(info_hash, false, true).await.unwrap();
    assert_eq!(scrape.num_peers, Some(1));

    let sample = timeout(TEST_TIMEOUT, nodes[1].sample_infohashes(info_hash))
        .await
        .unwrap()
        .unwrap();
    assert!(sample.samples.contains(&info_hash));
    assert!(sample.responders > 0);
}

#[tokio::test]
async fn immutable_item_round_trip() {
    let nodes = swarm(5).await;
    let value = Value::Bytes(b"Hello World!".to_vec());

    let (item, stored) = timeout(TEST_TIMEOUT, nodes[0].put_immutable(value.clone()))
        .await
        .unwrap()
        .unwrap();
    assert!(stored > 0);
    assert_eq!(item.encoded_value(), b"12:Hello World!");

    let got = timeout(TEST_TIMEOUT, nodes[3].get_immutable(item.target()))
        .await
        .unwrap()
        .unwrap()
        .expect("item not found");
    assert_eq!(got.value(), &value);

    let missing = nodes[3].get_immutable(generate_random_id()).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn mutable_item_sequence_advances() {
    let nodes = swarm(5).await;
    let key = SigningKey::generate(&mut OsRng);
    let public_key = key.verifying_key().to_bytes();
    let salt = b"profile".to_vec();

    let (first, stored) = timeout(TEST_TIMEOUT, nodes[0].put_mutable(key.clone(), salt.clone(), Value::Int(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.seq(), 1);
    assert!(stored > 0);

    let (second, _) = timeout(TEST_TIMEOUT, nodes[1].put_mutable(key, salt.clone(), Value::Int(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.seq(), 2);
    assert_eq!(second.target(), first.target());

    let got = timeout(TEST_TIMEOUT, nodes[4].get_mutable(public_key, salt))
        .await
        .unwrap()
        .unwrap()
        .expect("item not found");
    assert_eq!(got.seq(), 2);
    assert_eq!(got.value(), &Value::Int(2));

    // another salt is another item
    let other = nodes[4].get_mutable(public_key, b"other".to_vec()).await.unwrap();
    assert!(other.is_none());
}

#[tokio::test]
async fn oversized_put_is_rejected_locally() {
    let dht = spawn_node(test_settings()).await;
    let result = dht.put_immutable(Value::Bytes(vec![0u8; 1200])).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn saved_state_restores_id_and_nodes() {
    let nodes = swarm(3).await;
    let state = nodes[0].save_state().await.unwrap();
    let id = nodes[0].node_id().await.unwrap();
    assert_eq!(state.nodes.len(), 2);

    let decoded = DhtState::from_bytes(&state.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, state);

    let restarted = Dht::bind(loopback(), test_settings(), Some(decoded.clone())).await.unwrap();
    assert_eq!(restarted.node_id().await.unwrap(), id);

    let found = timeout(TEST_TIMEOUT, restarted.bootstrap(decoded.bootstrap_nodes().collect()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn state_file_round_trip() {
    let path = std::env::temp_dir().join(format!("bitdht-state-{}.dat", std::process::id()));
    let state = DhtState {
        node_ids: vec![(None, NodeId::from_bytes([7; 20]))],
        nodes: vec!["127.0.0.1:6881".parse().unwrap()],
        nodes6: Vec::new(),
    };
    state.save(&path).await.unwrap();
    assert_eq!(DhtState::load(&path).await.unwrap(), state);
    let _ = std::fs::remove_file(&path);

    assert!(DhtState::load(&path).await.is_err());
}

#[tokio::test]
async fn quit_stops_the_node() {
    let dht = spawn_node(test_settings()).await;
    let clone = dht.clone();
    dht.quit().await;
    assert!(clone.status().await.is_err());
}
