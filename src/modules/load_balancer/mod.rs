//! # Load Balancer Module
//!
//! The live backend set and the policies that pick from it.
//!
//! - [`backend`]: per-host [`BackendPool`] maintained by the DNS probe
//!   loop, with atomic per-backend counters.
//! - [`selector`]: pluggable policies (random, round-robin,
//!   least-connection, weighted-random) behind the [`Selector`] trait.
//! - [`affinity`]: source-IP to backend bindings with TTL, consulted by
//!   every selector before its algorithm runs.

pub mod affinity;
pub mod backend;
pub mod error;
pub mod selector;

pub use affinity::AffinityMap;
pub use backend::{Backend, BackendPool, ConnectionGuard};
pub use error::{LoadBalancerError, LoadBalancerResult};
pub use selector::{
    make_selector, LeastConnectionSelector, RandomSelector, RoundRobinSelector, Selector,
    WeightedRandomSelector,
};
