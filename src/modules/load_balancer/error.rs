//! Load balancer error types.

use thiserror::Error;

/// Errors that can occur during backend selection.
#[derive(Debug, Error)]
pub enum LoadBalancerError {
    /// The pool has no backends (DNS has not resolved any, or all were lost).
    #[error("no backends available for host '{0}'")]
    NoBackends(String),

    /// The configured algorithm name is not recognized.
    #[error("unknown load balancing algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Result type for load balancer operations.
pub type LoadBalancerResult<T> = Result<T, LoadBalancerError>;
