//! Shared helpers for the end-to-end forwarding tests.
//!
//! Backends live on distinct loopback addresses (`127.0.0.1`,
//! `127.0.0.2`, ...) sharing a single port, so one pool can hold several
//! distinguishable local backends.

// Each integration test crate compiles this module separately and uses
// a different subset of it.
#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use dnslb::modules::load_balancer::BackendPool;

/// Bind `n` listeners on distinct loopback addresses sharing one port.
pub async fn bind_loopback_group(n: usize) -> Vec<TcpListener> {
    assert!((1..=9).contains(&n));
    'attempt: for _ in 0..16 {
        let first = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let mut listeners = vec![first];
        for i in 2..=n {
            let ip: IpAddr = format!("127.0.0.{i}").parse().unwrap();
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => listeners.push(listener),
                Err(_) => continue 'attempt,
            }
        }
        return listeners;
    }
    panic!("could not allocate a shared loopback port group");
}

/// Build a pool over the listeners' addresses.
pub fn pool_for(host: &str, listeners: &[TcpListener]) -> Arc<BackendPool> {
    let port = listeners[0].local_addr().unwrap().port();
    let ips: Vec<IpAddr> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().ip())
        .collect();
    let pool = Arc::new(BackendPool::new(host, port));
    pool.apply_ip_set(&ips);
    pool
}

/// TCP backend that writes its tag to every connection.
///
/// With `hold_open` the connection stays up (reading until client EOF)
/// after the tag, pinning an active connection on the backend.
pub fn spawn_tag_backend(listener: TcpListener, tag: &'static str, hold_open: bool) {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if stream.write_all(tag.as_bytes()).await.is_err() {
                    return;
                }
                if hold_open {
                    let mut buf = [0u8; 256];
                    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                } else {
                    let _ = stream.shutdown().await;
                }
            });
        }
    });
}

/// TCP backend that captures everything it receives on the first
/// connection and reports it through the returned receiver.
pub fn spawn_capture_backend(listener: TcpListener) -> tokio::sync::oneshot::Receiver<Vec<u8>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut captured = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
            captured.extend_from_slice(&buf[..n]);
        }
        let _ = tx.send(captured);
    });
    rx
}
