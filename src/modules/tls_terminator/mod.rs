//! # TLS Terminator Module
//!
//! TLS material for HTTPS listeners: PEM loading into a rustls server
//! configuration, and the self-signed fallback used when no certificate
//! is supplied.

pub mod certificate;
pub mod error;
pub mod self_signed;

pub use certificate::load_server_config;
pub use error::{TlsError, TlsResult};
pub use self_signed::generate_self_signed;
