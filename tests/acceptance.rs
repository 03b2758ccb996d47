//! Acceptance tests for the networking layer.
//!
//! These tests exercise the end-to-end scenarios over real sockets on the
//! loopback range:
//!
//! 1. Self-connection detection via the pending handshake nonce
//! 2. Outbound slot refill after a channel dies
//! 3. Host pool bootstrap from a seed peer
//! 4. Inactivity kill on a silent channel
//! 5. Stop idempotence and hosts persistence
//! 6. Pass-through relay of unconsumed commands
//!
//! Nodes listen on distinct loopback IPs (127.0.0.x) so the one-channel-
//! per-remote-IP policy holds in-process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use galena_p2p::hosts::file as hosts_file;
use galena_p2p::{Endpoint, Message, NetworkAddress, P2p, P2pError, Settings};

/// Timeout for state-based waits.
const WAIT_TIMEOUT_MS: u64 = 15_000;

/// Wait for a condition with timeout, polling periodically.
async fn wait_for<F, Fut>(timeout_ms: u64, poll_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    let poll = Duration::from_millis(poll_ms);

    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        sleep(poll).await;
    }
}

/// Grab an ephemeral port from the OS.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}

fn addr(s: &str) -> NetworkAddress {
    NetworkAddress::from_socket(s.parse().unwrap(), 1)
}

/// Seed skip marker: an address nothing in these tests ever dials.
fn stocked() -> Vec<NetworkAddress> {
    vec![addr("198.51.100.99:1")]
}

/// Pre-write a node's hosts file so `start` loads a stocked pool.
async fn write_hosts(path: &Path, addrs: &[NetworkAddress]) {
    hosts_file::save(path, addrs).await.expect("write hosts file");
}

/// Base settings for test nodes: quiet, short dials, long idle timers.
fn base_settings(dir: &Path, hosts_name: &str) -> Settings {
    Settings::testnet()
        .with_inbound_port(0)
        .with_outbound_connections(0)
        .with_seeds(Vec::new())
        .with_hosts_file(dir.join(hosts_name))
        .with_connect_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(5))
        .with_germination(Duration::from_secs(5))
        .with_heartbeat(Duration::from_secs(60))
        .with_inactivity(Duration::from_secs(60))
        .with_expiration(Duration::from_secs(120))
}

/// Start a listener-only node on an ephemeral port.
async fn start_listener(dir: &Path, name: &str) -> (P2p, u16) {
    let port = free_port();
    let settings = base_settings(dir, name).with_inbound_port(port);
    write_hosts(&settings.hosts_file.clone(), &stocked()).await;

    let p2p = P2p::new(settings);
    p2p.start().await.expect("listener start");
    p2p.run().await.expect("listener run");
    (p2p, port)
}

// ============================================================================
// Scenario 1: Self-connection detection
// ============================================================================

#[tokio::test]
async fn test_handshake_self_connection_detected() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let settings = base_settings(dir.path(), "self.json")
        .with_inbound_port(port)
        .with_outbound_connections(1)
        .with_connection_limit(8)
        .with_manual_retry_limit(1);
    write_hosts(&settings.hosts_file.clone(), &stocked()).await;

    let p2p = P2p::new(settings);
    p2p.start().await.unwrap();
    p2p.run().await.unwrap();

    // Dial our own listener: the outbound nonce comes straight back in the
    // inbound version message.
    let completion = p2p.connect_with_handler("127.0.0.1", port);
    let result = completion.await.expect("manual completion");
    assert!(result.is_err(), "self-connection must not produce a channel");
    assert_ne!(result.err(), Some(P2pError::ServiceStopped));

    // Both ends wind down: nothing pending, nothing connected.
    assert!(
        wait_for(WAIT_TIMEOUT_MS, 50, || async {
            p2p.pent_count().await == 0 && p2p.connected_count().await == 0
        })
        .await,
        "self-connection left registry residue"
    );

    p2p.close().await;
}

// ============================================================================
// Scenario 2: Outbound refill
// ============================================================================

#[tokio::test]
async fn test_outbound_refill_after_channel_death() {
    let dir = tempfile::tempdir().unwrap();

    // Two reachable peers on distinct loopback IPs.
    let (peer_a, port_a) = start_listener(dir.path(), "peer_a.json").await;
    let (peer_b, port_b) = start_listener(dir.path(), "peer_b.json").await;

    // Pool: two live entries plus three dead TEST-NET entries.
    let pool = vec![
        addr(&format!("127.0.0.1:{}", port_a)),
        addr(&format!("127.0.0.2:{}", port_b)),
        addr("127.0.0.9:1"),
        addr("127.0.0.10:1"),
        addr("127.0.0.11:1"),
    ];

    let settings = base_settings(dir.path(), "main.json")
        .with_outbound_connections(2)
        .with_connect_batch_size(3)
        .with_connect_timeout(Duration::from_millis(500));
    write_hosts(&settings.hosts_file.clone(), &pool).await;

    let p2p = P2p::new(settings);
    let first_channel = {
        p2p.start().await.unwrap();
        let subscription = p2p.subscribe().unwrap();
        p2p.run().await.unwrap();
        subscription.await.expect("first promotion").expect("channel")
    };

    assert!(
        wait_for(WAIT_TIMEOUT_MS, 50, || async {
            p2p.connected_count().await == 2
        })
        .await,
        "expected both outbound slots to fill"
    );

    // Kill one channel; the slot must refill with a fresh channel.
    let refill = p2p.subscribe().unwrap();
    first_channel.stop(P2pError::ChannelDropped);

    let replacement = refill.await.expect("refill promotion").expect("channel");
    assert!(!Arc::ptr_eq(&first_channel, &replacement));
    assert!(
        wait_for(WAIT_TIMEOUT_MS, 50, || async {
            p2p.connected_count().await == 2
        })
        .await,
        "expected the vacated slot to refill"
    );

    // Every fill round dials at least one dead candidate (batches are three
    // distinct picks from a pool with only two live entries), and failed
    // dials are removed from the pool.
    assert!(
        wait_for(WAIT_TIMEOUT_MS, 50, || async {
            p2p.address_count().await < 5
        })
        .await,
        "expected dead candidates to be removed from the pool"
    );
    assert!(p2p.address_count().await >= 2, "live entries must survive");

    p2p.close().await;
    peer_a.close().await;
    peer_b.close().await;
}

// ============================================================================
// Scenario 3: Seed bootstrap
// ============================================================================

#[tokio::test]
async fn test_seed_bootstrap_fills_host_pool() {
    let dir = tempfile::tempdir().unwrap();

    // The seed peer's pool holds twenty harvestable addresses.
    let harvest: Vec<NetworkAddress> = (1..=20)
        .map(|i| addr(&format!("203.0.113.{}:7333", i)))
        .collect();
    let seed_port = free_port();
    let seed_settings = base_settings(dir.path(), "seed_peer.json").with_inbound_port(seed_port);
    write_hosts(&seed_settings.hosts_file.clone(), &harvest).await;

    let seed_peer = P2p::new(seed_settings);
    seed_peer.start().await.unwrap();
    seed_peer.run().await.unwrap();

    // The main node starts with nothing but the seed endpoint.
    let settings = base_settings(dir.path(), "main.json")
        .with_seeds(vec![Endpoint::new("127.0.0.1", seed_port)]);
    let p2p = P2p::new(settings);
    p2p.start().await.expect("seeded start");

    assert!(
        p2p.address_count().await >= 20,
        "seeding should stock the pool, got {}",
        p2p.address_count().await
    );

    // The seed channel is short-lived: the peer sees it close.
    assert!(
        wait_for(WAIT_TIMEOUT_MS, 50, || async {
            seed_peer.connected_count().await == 0
        })
        .await,
        "seed channel should be closed after the harvest"
    );

    p2p.close().await;
    seed_peer.close().await;
}

// ============================================================================
// Scenario 4: Inactivity kill
// ============================================================================

#[tokio::test]
async fn test_inactivity_kills_silent_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (peer, port) = start_listener(dir.path(), "peer.json").await;

    let settings = base_settings(dir.path(), "main.json")
        .with_inactivity(Duration::from_millis(700));
    write_hosts(&settings.hosts_file.clone(), &stocked()).await;

    let p2p = P2p::new(settings);
    p2p.start().await.unwrap();

    let first = p2p.subscribe().unwrap();
    p2p.connect("127.0.0.1", port);
    let channel = first.await.expect("promotion").expect("channel");

    // Nobody speaks after the handshake, so the idle timer fires.
    assert!(
        wait_for(WAIT_TIMEOUT_MS, 50, || async { channel.is_stopped() }).await,
        "silent channel should be killed"
    );
    assert_eq!(channel.stop_reason(), Some(P2pError::ChannelTimeout));

    // The bus saw no stop event; the next event is the redial's promotion
    // of a fresh channel.
    let next = p2p.subscribe().unwrap();
    let redialed = next.await.expect("redial promotion").expect("channel");
    assert!(!Arc::ptr_eq(&channel, &redialed));

    p2p.close().await;
    peer.close().await;
}

// ============================================================================
// Scenario 5: Stop idempotence and hosts persistence
// ============================================================================

#[tokio::test]
async fn test_stop_is_idempotent_and_persists_hosts() {
    let dir = tempfile::tempdir().unwrap();

    let initial = vec![
        addr("203.0.113.1:7333"),
        addr("203.0.113.2:7333"),
        addr("203.0.113.3:7333"),
    ];
    let settings = base_settings(dir.path(), "main.json");
    let hosts_path = settings.hosts_file.clone();
    write_hosts(&hosts_path, &initial).await;

    let p2p = P2p::new(settings);
    p2p.start().await.unwrap();
    assert_eq!(p2p.address_count().await, 3);

    p2p.store_address(addr("203.0.113.50:7333")).await.unwrap();

    assert!(p2p.stop().await.is_ok());
    assert_eq!(p2p.stop().await, Err(P2pError::ServiceStopped));
    assert_eq!(p2p.connected_count().await, 0);

    // The file reflects the pool as of the stop.
    let persisted = hosts_file::load(&hosts_path).await.unwrap();
    assert_eq!(persisted.len(), 4);

    p2p.close().await;
}

// ============================================================================
// Scenario 6: Unconsumed commands pass through to channel subscribers
// ============================================================================

#[tokio::test]
async fn test_unknown_command_relayed_to_channel_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (peer, port) = start_listener(dir.path(), "peer.json").await;

    let settings = base_settings(dir.path(), "main.json");
    write_hosts(&settings.hosts_file.clone(), &stocked()).await;
    let p2p = P2p::new(settings);
    p2p.start().await.unwrap();

    // Capture both ends of the link.
    let peer_promotion = peer.subscribe().unwrap();
    let main_promotion = p2p.subscribe().unwrap();
    p2p.connect("127.0.0.1", port);

    let main_channel = main_promotion.await.expect("promotion").expect("channel");
    let peer_channel = peer_promotion.await.expect("promotion").expect("channel");
    let mut inbox = peer_channel.subscribe_messages();

    // A command the core does not consume travels the wire unchanged.
    let inventory = Message::Unknown {
        command: "inv".to_string(),
        payload: vec![0xab; 36],
    };
    main_channel.send(inventory.clone()).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
        .await
        .expect("relay timeout")
        .expect("channel closed");
    assert_eq!(received, inventory);

    // Broadcast reaches the only live channel.
    assert_eq!(p2p.broadcast(Message::Unknown {
        command: "mempool".to_string(),
        payload: Vec::new(),
    })
    .await, 1);

    p2p.close().await;
    peer.close().await;
}
