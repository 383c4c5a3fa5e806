//! # HTTP/HTTPS Handler Module
//!
//! L7 forwarding: TLS termination at the listener, HTTP/1.1 reverse
//! proxying toward plain-HTTP backends, and layered session affinity
//! (source IP over cookie over algorithm) with a `proxy-affinity`
//! cookie emitted on every proxied response.

pub mod error;
pub mod handler;

pub use error::{HttpError, HttpResult};
pub use handler::{HttpForwarder, AFFINITY_COOKIE};
