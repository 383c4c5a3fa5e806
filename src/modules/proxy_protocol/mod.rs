//! # PROXY Protocol Module
//!
//! HAProxy PROXY protocol support: header generation toward backends
//! (`proxy-client=`) and auto-detecting ingest from upstream proxies
//! (`proxy-server=`), v1 text and v2 binary.

pub mod accept;
pub mod header;

pub use accept::{read_proxy_header, ProxyHeader};
pub use header::{encode, encode_v1, encode_v2};
