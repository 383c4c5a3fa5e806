//! Per-connection forwarding path.
//!
//! One task per accepted connection: recover the client address
//! (optionally from a PROXY header), select a backend, dial it,
//! optionally emit a PROXY header, then splice bytes in both directions
//! until either side closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::modules::load_balancer::ConnectionGuard;
use crate::modules::proxy_protocol::{encode, read_proxy_header};
use crate::modules::stats::OpenGuard;

use super::listener::TcpForwarder;

impl TcpForwarder {
    /// Forward one accepted connection to a selected backend.
    pub(crate) async fn forward(&self, mut client: TcpStream, peer_addr: std::net::SocketAddr) {
        let port = self.listen_port;
        let Ok(local_addr) = client.local_addr() else {
            return;
        };

        let _open = OpenGuard::open(&self.counters);

        // With PROXY ingest enabled, the announced address replaces the
        // immediate peer for affinity, selection and the emitted header.
        let mut client_addr = peer_addr;
        if self.proxy.server_enabled {
            match read_proxy_header(&mut client).await {
                Ok(Some(header)) => {
                    debug!(port, from = %peer_addr, source = %header.source, version = %header.version, "PROXY header accepted");
                    client_addr = header.source;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(port, from = %peer_addr, error = %e, "PROXY header read failed");
                    return;
                }
            }
        }
        let source_ip = Some(client_addr.ip());

        let backend = match self
            .selector
            .select(&self.pool, source_ip, self.affinity.as_deref())
        {
            Ok(backend) => backend,
            Err(e) => {
                error!(port, from = %client_addr, error = %e, "Backend selection failed");
                return;
            }
        };

        let _conn =
            ConnectionGuard::connect(&self.pool, &backend, self.affinity.as_ref(), source_ip);

        let backend_addr = backend.addr();
        let mut upstream = match TcpStream::connect(backend_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(port, from = %client_addr, addr = %backend_addr, error = %e, "Dial failed");
                return;
            }
        };

        info!(
            port,
            from = %client_addr,
            to = %backend_addr,
            backend = %backend.ip(),
            algorithm = self.selector.name(),
            count = self.counters.ops(),
            opened = self.counters.opened(),
            "Forwarding start"
        );

        if self.proxy.client_enabled {
            let header = encode(self.proxy.client_version, client_addr, local_addr);
            if let Err(e) = upstream.write_all(&header).await {
                error!(port, from = %client_addr, to = %backend_addr, error = %e, "PROXY header write failed");
                return;
            }
        }

        let start = Instant::now();
        let (sent, received) = splice(port, &mut client, &mut upstream).await;
        let duration = start.elapsed();

        self.pool.add_bytes(&backend, sent + received);
        self.counters.add_transfer(sent, received);

        info!(
            port,
            from = %client_addr,
            to = %backend_addr,
            backend = %backend.ip(),
            sent,
            received,
            ?duration,
            count = self.counters.ops(),
            opened = self.counters.opened(),
            cum_sent = self.counters.cum_sent(),
            cum_received = self.counters.cum_received(),
            "Forwarding close"
        );
    }
}

/// Copy bytes in both directions until both sides close.
///
/// Returns `(sent, received)` as seen from the client: `sent` flowed
/// upstream-to-client, `received` client-to-upstream. EOF in one
/// direction shuts down the peer's write half, so the other direction
/// winds down as soon as the peer closes in turn. A shared flag keeps
/// the teardown race from being reported twice.
async fn splice(port: u16, client: &mut TcpStream, upstream: &mut TcpStream) -> (u64, u64) {
    let closed = AtomicBool::new(false);
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        match result {
            Ok(n) => {
                closed.store(true, Ordering::SeqCst);
                n
            }
            Err(e) => {
                if !closed.swap(true, Ordering::SeqCst) {
                    error!(port, error = %e, "Connection error");
                }
                0
            }
        }
    };

    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        match result {
            Ok(n) => {
                closed.store(true, Ordering::SeqCst);
                n
            }
            Err(e) => {
                if !closed.swap(true, Ordering::SeqCst) {
                    error!(port, error = %e, "Connection error");
                }
                0
            }
        }
    };

    let (received, sent) = tokio::join!(client_to_upstream, upstream_to_client);
    (sent, received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyProtocolConfig;
    use crate::modules::load_balancer::{make_selector, BackendPool};
    use crate::modules::stats::GlobalCounters;
    use std::net::IpAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Echo server that reports its bound address.
    async fn spawn_echo_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn forwarder_for(backend: std::net::SocketAddr) -> Arc<TcpForwarder> {
        let pool = Arc::new(BackendPool::new("backends", backend.port()));
        pool.apply_ip_set(&[backend.ip()]);
        Arc::new(
            TcpForwarder::bind(
                0,
                pool,
                make_selector("random", false).unwrap(),
                None,
                ProxyProtocolConfig::default(),
                Arc::new(GlobalCounters::new()),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_forward_echoes_bytes() {
        let backend = spawn_echo_backend().await;
        let forwarder = forwarder_for(backend).await;
        let addr = forwarder.local_addr().unwrap();
        tokio::spawn(Arc::clone(&forwarder).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn test_forward_updates_counters() {
        let backend = spawn_echo_backend().await;
        let forwarder = forwarder_for(backend).await;
        let addr = forwarder.local_addr().unwrap();
        tokio::spawn(Arc::clone(&forwarder).run());

        {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"hello").await.unwrap();
            let mut reply = [0u8; 5];
            client.read_exact(&mut reply).await.unwrap();
        } // client dropped; connection winds down

        // Wait for the forwarding task to finish its teardown.
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if forwarder.counters.opened() == 0 && forwarder.counters.cum_received() >= 5 {
                break;
            }
            assert!(Instant::now() < deadline, "teardown did not complete");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(forwarder.counters.ops(), 1);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let b = forwarder.pool.get(ip).unwrap();
        assert_eq!(b.active_conns(), 0);
        assert_eq!(b.total_conns(), 1);
        assert!(b.total_bytes() >= 10); // 5 bytes each way
    }

    #[tokio::test]
    async fn test_dial_failure_does_not_leak_counters() {
        // A pool member nothing listens on.
        let pool = Arc::new(BackendPool::new("backends", 1));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        pool.apply_ip_set(&[ip]);

        let forwarder = Arc::new(
            TcpForwarder::bind(
                0,
                Arc::clone(&pool),
                make_selector("random", false).unwrap(),
                None,
                ProxyProtocolConfig::default(),
                Arc::new(GlobalCounters::new()),
            )
            .await
            .unwrap(),
        );
        let addr = forwarder.local_addr().unwrap();
        tokio::spawn(Arc::clone(&forwarder).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        // The forwarder closes the connection after the failed dial.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        while forwarder.counters.opened() != 0 {
            assert!(Instant::now() < deadline, "open gauge did not recover");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(pool.get(ip).unwrap().active_conns(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_closes_connection() {
        let pool = Arc::new(BackendPool::new("backends", 9000));
        let forwarder = Arc::new(
            TcpForwarder::bind(
                0,
                pool,
                make_selector("random", false).unwrap(),
                None,
                ProxyProtocolConfig::default(),
                Arc::new(GlobalCounters::new()),
            )
            .await
            .unwrap(),
        );
        let addr = forwarder.local_addr().unwrap();
        tokio::spawn(Arc::clone(&forwarder).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "connection should close with no backends");
    }
}
