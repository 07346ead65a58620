//! DHT and NAT coordination scenarios.

use std::time::Duration;
use stt_crypto::{AdContext, CryptoProvider, SeedCrypto};
use stt_discovery::dht::{Contact, KademliaDht, NodeId};
use stt_discovery::nat::{Endpoint, ManualNatCoordinator, NatCoordinator, RelayNatCoordinator};
use stt_discovery::relay::RelayServer;

async fn dht_network(size: usize) -> Vec<(KademliaDht, std::net::SocketAddr)> {
    let mut nodes = Vec::with_capacity(size);
    for _ in 0..size {
        let dht = KademliaDht::new(NodeId::random(), "127.0.0.1", 0);
        let addr = dht.start().await.unwrap();
        nodes.push((dht, addr));
    }
    // Everyone bootstraps off the first node.
    let (first, first_addr) = &nodes[0];
    let seed_contact = Contact::new(first.node_id(), first_addr.ip().to_string(), first_addr.port());
    for (dht, _) in nodes.iter().skip(1) {
        dht.bootstrap(vec![seed_contact.clone()]).await;
    }
    nodes
}

// ---------------------------------------------------------------------
// Kademlia put/get across a small network
// ---------------------------------------------------------------------

#[tokio::test]
async fn kademlia_put_get_five_nodes() {
    let nodes = dht_network(5).await;

    let crypto = SeedCrypto::new(b"content-hash-seed");
    let content_id = NodeId::from_bytes(crypto.hash(b"hello", &AdContext::purpose("content_id")));

    // N1 stores; the value replicates across the closest nodes.
    let stored = nodes[0].0.store(content_id, b"hello world".to_vec()).await;
    assert!(stored >= 2, "expected replication, got {stored} copies");

    // N5 does not store it locally but can retrieve it.
    let value = nodes[4].0.find_value(&content_id).await.unwrap();
    assert_eq!(value, b"hello world");

    for (dht, _) in &nodes {
        dht.stop().await;
    }
}

#[tokio::test]
async fn kademlia_find_node_converges() {
    let nodes = dht_network(5).await;

    let target = NodeId::random();
    let found = nodes[2].0.find_node(&target).await;
    assert!(!found.is_empty());

    // Results come back sorted by XOR distance to the target.
    for pair in found.windows(2) {
        assert!(pair[0].node_id.distance(&target) <= pair[1].node_id.distance(&target));
    }

    for (dht, _) in &nodes {
        dht.stop().await;
    }
}

#[tokio::test]
async fn kademlia_provider_announcement() {
    let nodes = dht_network(4).await;

    let content_id = NodeId::from_bytes([0x77; 32]);
    nodes[1].0.announce_provider(content_id).await;

    let providers = nodes[3].0.find_providers(&content_id).await;
    assert!(
        providers.iter().any(|c| c.node_id == nodes[1].0.node_id()),
        "announcing node not found among providers"
    );

    for (dht, _) in &nodes {
        dht.stop().await;
    }
}

#[tokio::test]
async fn kademlia_bootstrap_populates_routing_tables() {
    let nodes = dht_network(5).await;
    // After the self-lookups, every node should know at least the seed.
    for (dht, _) in &nodes {
        assert!(dht.routing().contact_count().await >= 1);
    }
    for (dht, _) in &nodes {
        dht.stop().await;
    }
}

// ---------------------------------------------------------------------
// Manual NAT coordination
// ---------------------------------------------------------------------

#[tokio::test]
async fn manual_coordination() {
    let alice_id = [0xA0; 32];
    let bob_id = [0xB0; 32];

    let alice = ManualNatCoordinator::new();
    let bob = ManualNatCoordinator::new();

    alice.configure_peer(bob_id, "127.0.0.1", 8002);
    bob.configure_peer(alice_id, "127.0.0.1", 8001);
    alice.register_local("127.0.0.1", 8001).await.unwrap();
    bob.register_local("127.0.0.1", 8002).await.unwrap();

    assert_eq!(
        alice.resolve(&bob_id, None).await.unwrap(),
        Endpoint::new("127.0.0.1", 8002)
    );
    assert_eq!(
        bob.resolve(&alice_id, None).await.unwrap(),
        Endpoint::new("127.0.0.1", 8001)
    );

    // Unconfigured peers fail the connect.
    assert!(alice.resolve(&[0xEE; 32], None).await.is_err());
}

// ---------------------------------------------------------------------
// Relay coordination
// ---------------------------------------------------------------------

#[tokio::test]
async fn relay_coordination_direct_then_pinned() {
    let server = RelayServer::new("127.0.0.1", 0);
    let relay_addr = server.start().await.unwrap();

    let alice_id = [0xA1; 32];
    let bob_id = [0xB1; 32];
    let alice = RelayNatCoordinator::new(alice_id, "127.0.0.1", relay_addr.port(), true);
    let bob = RelayNatCoordinator::new(bob_id, "127.0.0.1", relay_addr.port(), true);

    alice.register_local("10.0.1.100", 8001).await.unwrap();
    bob.register_local("10.0.2.200", 8002).await.unwrap();

    // First resolution follows the direct hint.
    let hint = Endpoint::new("10.0.2.200", 8002);
    let first = alice.resolve(&bob_id, Some(hint.clone())).await.unwrap();
    assert_eq!(first, hint);

    // The direct dial is reported failed; Bob is pinned to the relay.
    alice.mark_relay_required(bob_id);
    let second = alice.resolve(&bob_id, None).await.unwrap();
    assert_eq!(second, Endpoint::new("127.0.0.1", relay_addr.port()));

    let stats = alice.stats();
    assert_eq!(stats.direct_attempts, 1);
    assert_eq!(stats.relay_attempts, 1);
    assert_eq!(stats.relayed_peers, 1);

    alice.unregister().await.unwrap();
    bob.unregister().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn relay_lookup_returns_registered_endpoint() {
    let server = RelayServer::new("127.0.0.1", 0);
    let relay_addr = server.start().await.unwrap();

    let alice = RelayNatCoordinator::new([0xA2; 32], "127.0.0.1", relay_addr.port(), true);
    let charlie = RelayNatCoordinator::new([0xC2; 32], "127.0.0.1", relay_addr.port(), true);

    alice.register_local("10.0.1.100", 8001).await.unwrap();
    charlie.register_local("203.0.113.50", 8003).await.unwrap();

    // Charlie is publicly reachable; the relay hands out his endpoint.
    let resolved = alice.resolve(&[0xC2; 32], None).await.unwrap();
    assert_eq!(resolved, Endpoint::new("203.0.113.50", 8003));

    // A confirmed direct connection is memoised.
    alice.mark_direct_success([0xC2; 32], resolved.clone());
    assert_eq!(alice.resolve(&[0xC2; 32], None).await.unwrap(), resolved);
    assert_eq!(alice.stats().direct_peers, 1);

    server.stop().await;
}

#[tokio::test]
async fn relay_registrations_expire_without_refresh() {
    let server = RelayServer::with_config(
        "127.0.0.1",
        0,
        stt_discovery::relay::RelayServerConfig {
            registration_grace: Duration::from_millis(80),
            eviction_interval: Duration::from_millis(25),
        },
    );
    let relay_addr = server.start().await.unwrap();

    // Announce directly, without a refresh loop.
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let announce = stt_discovery::relay::RelayMessage::Announce {
        node_id: [0xD0; 32],
        host: "10.0.9.9".into(),
        port: 9009,
    };
    socket
        .send_to(&announce.to_bytes().unwrap(), relay_addr)
        .await
        .unwrap();
    let mut buf = vec![0u8; 256];
    tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .expect("no announce ack")
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.is_registered(&[0xD0; 32]) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stale registration never evicted");

    server.stop().await;
}
