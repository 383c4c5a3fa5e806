//! # Stats Module
//!
//! Process-wide counters shared by the forwarders, and the read-only
//! stats HTTP surface that samples them.

pub mod counters;
pub mod server;

pub use counters::{GlobalCounters, OpenGuard};
pub use server::StatsServer;
