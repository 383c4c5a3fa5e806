//! HTTP handler error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the HTTP handler module.
///
/// Per-request failures never surface here; they become HTTP 503s or
/// whatever the reverse proxy emits mid-response.
#[derive(Debug, Error)]
pub enum HttpError {
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

/// Result type for HTTP handler operations.
pub type HttpResult<T> = Result<T, HttpError>;
