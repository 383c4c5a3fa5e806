//! # DNS Module
//!
//! Periodic name resolution driving backend pool membership. One probe
//! task per hostname; pools subscribe and receive full IP sets on change.

pub mod resolver;

pub use resolver::{DnsResolver, DnsSubscriber};
