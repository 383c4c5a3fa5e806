//! # Configuration
//!
//! Command-line configuration model for the load balancer: mapping
//! arguments, per-mapping options and the PROXY protocol settings each
//! mapping carries. Parsing failures are fatal at startup.

pub mod error;
pub mod parse;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use parse::{parse_backend_weights, parse_mapping, parse_port_range, parse_proxy_version, ProxyDefaults};
pub use types::{ForwardMode, PortMapping, ProxyProtocolConfig, ProxyVersion};
