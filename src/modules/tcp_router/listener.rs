//! TCP listener and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ProxyProtocolConfig;
use crate::modules::load_balancer::{AffinityMap, BackendPool, Selector};
use crate::modules::stats::GlobalCounters;

use super::error::{TcpRouterError, TcpRouterResult};

/// One L4 forwarding listener for a mapping.
///
/// Accepts client connections and spawns one forwarding task per
/// connection; the per-connection path lives in
/// [`connection`](super::connection).
pub struct TcpForwarder {
    pub(crate) listener: TcpListener,
    pub(crate) listen_port: u16,
    pub(crate) pool: Arc<BackendPool>,
    pub(crate) selector: Arc<dyn Selector>,
    pub(crate) affinity: Option<Arc<AffinityMap>>,
    pub(crate) proxy: ProxyProtocolConfig,
    pub(crate) counters: Arc<GlobalCounters>,
}

impl TcpForwarder {
    /// Bind the listen socket for a mapping.
    ///
    /// # Errors
    ///
    /// Returns [`TcpRouterError::BindError`] if binding fails; this is
    /// fatal at startup.
    pub async fn bind(
        listen_port: u16,
        pool: Arc<BackendPool>,
        selector: Arc<dyn Selector>,
        affinity: Option<Arc<AffinityMap>>,
        proxy: ProxyProtocolConfig,
        counters: Arc<GlobalCounters>,
    ) -> TcpRouterResult<Self> {
        let address = SocketAddr::from(([0, 0, 0, 0], listen_port));
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TcpRouterError::BindError { address, source: e })?;
        let listen_port = listener
            .local_addr()
            .map_err(|e| TcpRouterError::BindError { address, source: e })?
            .port();

        Ok(Self {
            listener,
            listen_port,
            pool,
            selector,
            affinity,
            proxy,
            counters,
        })
    }

    /// Get the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails fatally.
    ///
    /// # Errors
    ///
    /// Returns [`TcpRouterError::AcceptError`] on an unrecoverable
    /// accept failure; the caller treats this as fatal.
    pub async fn run(self: Arc<Self>) -> TcpRouterResult<()> {
        info!(
            port = self.listen_port,
            host = self.pool.host(),
            backend_port = self.pool.backend_port(),
            algorithm = self.selector.name(),
            "Forwarding"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let forwarder = Arc::clone(&self);
                    tokio::spawn(async move {
                        forwarder.forward(stream, peer_addr).await;
                    });
                }
                Err(e) if is_fatal_accept_error(&e) => {
                    return Err(TcpRouterError::AcceptError(e));
                }
                Err(e) => {
                    warn!(port = self.listen_port, error = %e, "Transient accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Check if an accept error is fatal (unrecoverable).
fn is_fatal_accept_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::NotFound
    )
}
