//! # dnslb
//!
//! A lightweight L4/L7 load balancer for container environments where a
//! logical service name resolves via DNS to a dynamically changing set
//! of backend addresses.
//!
//! ## Features
//!
//! - DNS-driven backend discovery with per-host probe loops
//! - Selectable policies: random, round-robin, least-connection,
//!   weighted-random
//! - Source-IP affinity with TTL, plus cookie affinity on the HTTP path
//! - PROXY protocol v1/v2, both ingest and emission
//! - TLS termination with a self-signed fallback certificate
//!
//! ## Architecture
//!
//! A DNS resolver per host pushes IP sets into backend pools. Each
//! mapping runs one listener ([`modules::tcp_router`] or
//! [`modules::http_handler`]) which consults a selector
//! ([`modules::load_balancer`]) per connection or request, forwards to
//! the chosen backend, and keeps per-backend and process-wide counters
//! ([`modules::stats`]) up to date.

pub mod config;
pub mod modules;
