//! Configuration error types.

use thiserror::Error;

/// Errors raised while parsing command-line configuration.
///
/// Every variant is fatal at startup: the process reports the error and
/// exits with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The mapping argument does not match `[listen:]host:backend[,opt]*`.
    #[error("mapping '{0}' is not in [listen[-listen2]:]host:backend[-backend2][,option]* format")]
    InvalidMapping(String),

    /// A port expression failed to parse.
    #[error("invalid port '{0}': {1}")]
    InvalidPort(String, #[source] std::num::ParseIntError),

    /// A port range is malformed (missing bound or start > end).
    #[error("invalid port range '{0}': start port must be <= end port")]
    InvalidPortRange(String),

    /// Listen and backend ranges expand to different lengths.
    #[error("listen port range ({listen} ports) and backend port range ({backend} ports) must have the same length")]
    RangeLengthMismatch {
        /// Number of listen ports.
        listen: usize,
        /// Number of backend ports.
        backend: usize,
    },

    /// A mapping option is not one of the known option names.
    #[error("unknown mapping option '{0}'")]
    UnknownOption(String),

    /// A mapping requests both `http` and `https`.
    #[error("mapping '{0}' requests both http and https modes")]
    ConflictingModes(String),

    /// A PROXY protocol option value is not v1/1/v2/2.
    #[error("invalid proxy protocol version '{0}' (expected v1, v2, 1 or 2)")]
    InvalidProxyVersion(String),
}

/// Result type for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;
