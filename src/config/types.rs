//! Configuration types for listeners and mappings.

use serde::Serialize;
use std::fmt;

/// How traffic on a listener is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Raw TCP byte forwarding.
    #[default]
    Tcp,
    /// HTTP reverse proxying.
    Http,
    /// HTTP reverse proxying with TLS termination at the listener.
    Https,
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// PROXY protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ProxyVersion {
    /// Human-readable v1 header (`PROXY TCP4 ...\r\n`).
    #[default]
    V1,
    /// Binary v2 header.
    V2,
}

impl fmt::Display for ProxyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// PROXY protocol settings for one mapping, computed once at startup.
///
/// `server_*` controls ingest of headers from a proxy in front of us;
/// `client_*` controls emission of headers toward backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyProtocolConfig {
    /// Accept PROXY headers on accepted connections.
    pub server_enabled: bool,
    /// Advertised ingest version (the wire side auto-detects either).
    pub server_version: ProxyVersion,
    /// Emit a PROXY header to the backend before any client bytes.
    pub client_enabled: bool,
    /// Version of the emitted header.
    pub client_version: ProxyVersion,
}

/// One front-end listener with its forwarding target and options.
///
/// A range expression `a-b:host:c-d` expands into one mapping per port
/// pair before this struct is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Port the listener binds on.
    pub listen_port: u16,
    /// Logical backend host name, resolved by the DNS probe loop.
    pub host: String,
    /// Port backends are reached on.
    pub backend_port: u16,
    /// Forwarding mode.
    pub mode: ForwardMode,
    /// Per-mapping algorithm override (`lb=` option); `None` uses the
    /// global `--lb-algorithm`.
    pub algorithm: Option<String>,
    /// Whether source-IP affinity is enabled for this mapping's host.
    pub affinity_enabled: bool,
    /// PROXY protocol settings.
    pub proxy: ProxyProtocolConfig,
}
