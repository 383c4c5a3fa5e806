//! End-to-end TCP forwarding scenarios against live loopback backends.

mod common;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use dnslb::config::{ProxyProtocolConfig, ProxyVersion};
use dnslb::modules::load_balancer::{make_selector, AffinityMap, BackendPool};
use dnslb::modules::proxy_protocol::encode_v2;
use dnslb::modules::stats::GlobalCounters;
use dnslb::modules::tcp_router::TcpForwarder;

use common::{bind_loopback_group, pool_for, spawn_capture_backend, spawn_tag_backend};

const TAGS: [&str; 3] = ["alpha", "bravo", "delta"];

async fn spawn_forwarder(
    pool: Arc<BackendPool>,
    algorithm: &str,
    affinity: Option<Arc<AffinityMap>>,
    proxy: ProxyProtocolConfig,
) -> SocketAddr {
    let forwarder = Arc::new(
        TcpForwarder::bind(
            0,
            pool,
            make_selector(algorithm, false).unwrap(),
            affinity,
            proxy,
            Arc::new(GlobalCounters::new()),
        )
        .await
        .unwrap(),
    );
    let port = forwarder.local_addr().unwrap().port();
    tokio::spawn(forwarder.run());
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Connect, send a request line, read the tag the backend replies with.
async fn fetch_tag(addr: SocketAddr) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET /\r\n\r\n").await.unwrap();
    let mut tag = String::new();
    client.read_to_string(&mut tag).await.unwrap();
    tag
}

#[tokio::test]
async fn test_random_reaches_every_backend() {
    let listeners = bind_loopback_group(3).await;
    let pool = pool_for("backends", &listeners);
    for (listener, tag) in listeners.into_iter().zip(TAGS) {
        spawn_tag_backend(listener, tag, false);
    }
    let addr = spawn_forwarder(pool, "random", None, ProxyProtocolConfig::default()).await;

    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..60 {
        *seen.entry(fetch_tag(addr).await).or_insert(0) += 1;
    }
    assert_eq!(seen.len(), 3, "random should reach all backends: {seen:?}");
}

#[tokio::test]
async fn test_round_robin_rotates_across_connections() {
    let listeners = bind_loopback_group(3).await;
    let pool = pool_for("backends", &listeners);
    for (listener, tag) in listeners.into_iter().zip(TAGS) {
        spawn_tag_backend(listener, tag, false);
    }
    let addr = spawn_forwarder(pool, "round-robin", None, ProxyProtocolConfig::default()).await;

    let mut picks = Vec::new();
    for _ in 0..6 {
        picks.push(fetch_tag(addr).await);
    }

    let mut counts: HashMap<&String, usize> = HashMap::new();
    for tag in &picks {
        *counts.entry(tag).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&c| c == 2), "picks: {picks:?}");
    assert_eq!(&picks[..3], &picks[3..], "rotation should be consistent");
    for pair in picks.windows(2) {
        assert_ne!(pair[0], pair[1], "no consecutive repeats with n > 1");
    }
}

#[tokio::test]
async fn test_least_connection_chooses_idle_backend() {
    let listeners = bind_loopback_group(3).await;
    let pool = pool_for("backends", &listeners);
    for (listener, tag) in listeners.into_iter().zip(TAGS) {
        spawn_tag_backend(listener, tag, true); // connections stay open
    }
    let addr = spawn_forwarder(
        pool,
        "least-connection",
        None,
        ProxyProtocolConfig::default(),
    )
    .await;

    // Two long-lived clients pin two distinct backends.
    let mut held = Vec::new();
    let mut busy_tags = Vec::new();
    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut tag = vec![0u8; 5]; // all tags are 5 bytes
        client.read_exact(&mut tag).await.unwrap();
        busy_tags.push(String::from_utf8(tag).unwrap());
        held.push(client);
    }
    assert_ne!(busy_tags[0], busy_tags[1]);

    // The short third connection must land on the remaining backend.
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut tag = vec![0u8; 5];
    client.read_exact(&mut tag).await.unwrap();
    let third = String::from_utf8(tag).unwrap();
    assert!(!busy_tags.contains(&third), "busy: {busy_tags:?}, third: {third}");
}

#[tokio::test]
async fn test_proxy_v1_client_emit_prefixes_payload() {
    let listeners = bind_loopback_group(1).await;
    let pool = pool_for("backends", &listeners);
    let captured = spawn_capture_backend(listeners.into_iter().next().unwrap());

    let proxy = ProxyProtocolConfig {
        client_enabled: true,
        client_version: ProxyVersion::V1,
        ..ProxyProtocolConfig::default()
    };
    let addr = spawn_forwarder(pool, "random", None, proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.write_all(b"payload-bytes").await.unwrap();
    client.shutdown().await.unwrap();

    let bytes = tokio::time::timeout(Duration::from_secs(5), captured)
        .await
        .unwrap()
        .unwrap();
    let expected_header = format!(
        "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\n",
        client_addr.port(),
        addr.port()
    );
    let mut expected = expected_header.into_bytes();
    expected.extend_from_slice(b"payload-bytes");
    assert_eq!(bytes, expected);
}

#[tokio::test]
async fn test_proxy_v2_server_ingest_recovers_source() {
    let listeners = bind_loopback_group(1).await;
    let pool = pool_for("backends", &listeners);
    let captured = spawn_capture_backend(listeners.into_iter().next().unwrap());

    let affinity = Arc::new(AffinityMap::new("backends", Duration::from_secs(60)));
    let proxy = ProxyProtocolConfig {
        server_enabled: true,
        server_version: ProxyVersion::V2,
        ..ProxyProtocolConfig::default()
    };
    let addr = spawn_forwarder(pool, "random", Some(Arc::clone(&affinity)), proxy).await;

    let announced: SocketAddr = "192.0.2.10:5555".parse().unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut bytes = encode_v2(announced, "203.0.113.1:80".parse().unwrap());
    bytes.extend_from_slice(b"ping");
    client.write_all(&bytes).await.unwrap();
    client.shutdown().await.unwrap();

    // The backend sees the payload, not the header.
    let received = tokio::time::timeout(Duration::from_secs(5), captured)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"ping");

    // The announced source, not the loopback peer, drives affinity.
    let announced_ip: IpAddr = "192.0.2.10".parse().unwrap();
    assert!(
        affinity.get(announced_ip).is_some(),
        "affinity should key on the PROXY-announced source"
    );
    assert!(affinity.get("127.0.0.1".parse().unwrap()).is_none());
}

#[tokio::test]
async fn test_affinity_pins_tcp_connections() {
    let listeners = bind_loopback_group(3).await;
    let pool = pool_for("backends", &listeners);
    for (listener, tag) in listeners.into_iter().zip(TAGS) {
        spawn_tag_backend(listener, tag, false);
    }
    let affinity = Arc::new(AffinityMap::new("backends", Duration::from_secs(60)));
    let addr = spawn_forwarder(
        pool,
        "random",
        Some(affinity),
        ProxyProtocolConfig::default(),
    )
    .await;

    // Same source IP on every connection, so the first pick sticks.
    let first = fetch_tag(addr).await;
    for _ in 0..10 {
        assert_eq!(fetch_tag(addr).await, first);
    }
}
