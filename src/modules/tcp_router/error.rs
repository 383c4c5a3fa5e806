//! TCP router error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the TCP router module.
///
/// Only startup and accept-loop failures surface here; per-connection
/// failures (selection, dial, copy) are logged and close the connection.
#[derive(Debug, Error)]
pub enum TcpRouterError {
    /// Failed to bind the listen socket.
    #[error("failed to bind to {address}: {source}")]
    BindError {
        /// The address that failed to bind.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The accept loop hit an unrecoverable error.
    #[error("failed to accept connection: {0}")]
    AcceptError(#[source] std::io::Error),
}

/// Result type for TCP router operations.
pub type TcpRouterResult<T> = Result<T, TcpRouterError>;
