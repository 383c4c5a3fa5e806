//! Process-wide connection counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters shared by every forwarder in the process.
///
/// All fields are atomics; readers get point-in-time samples that are
/// not linearized against individual updates.
#[derive(Debug, Default)]
pub struct GlobalCounters {
    /// Total connections/requests handled.
    ops: AtomicU64,
    /// Connections currently open.
    opened: AtomicI64,
    /// Cumulative bytes sent to clients.
    cum_sent: AtomicU64,
    /// Cumulative bytes received from clients.
    cum_received: AtomicU64,
}

impl GlobalCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly opened connection.
    pub fn record_open(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection.
    pub fn record_close(&self) {
        self.opened.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record bytes moved by a finished connection.
    pub fn add_transfer(&self, sent: u64, received: u64) {
        self.cum_sent.fetch_add(sent, Ordering::Relaxed);
        self.cum_received.fetch_add(received, Ordering::Relaxed);
    }

    /// Total handled connections.
    #[must_use]
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Currently open connections.
    #[must_use]
    pub fn opened(&self) -> i64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Cumulative bytes sent to clients.
    #[must_use]
    pub fn cum_sent(&self) -> u64 {
        self.cum_sent.load(Ordering::Relaxed)
    }

    /// Cumulative bytes received from clients.
    #[must_use]
    pub fn cum_received(&self) -> u64 {
        self.cum_received.load(Ordering::Relaxed)
    }
}

/// Holds the open-connection gauge up for its lifetime.
///
/// Created when a connection or request starts; the drop runs on every
/// exit path, so error returns never leave the gauge high.
#[derive(Debug)]
pub struct OpenGuard {
    counters: std::sync::Arc<GlobalCounters>,
}

impl OpenGuard {
    /// Record an open and return the guard that records the close.
    #[must_use]
    pub fn open(counters: &std::sync::Arc<GlobalCounters>) -> Self {
        counters.record_open();
        Self {
            counters: std::sync::Arc::clone(counters),
        }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.counters.record_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_guard_restores_gauge() {
        let counters = std::sync::Arc::new(GlobalCounters::new());
        {
            let _guard = OpenGuard::open(&counters);
            assert_eq!(counters.opened(), 1);
            assert_eq!(counters.ops(), 1);
        }
        assert_eq!(counters.opened(), 0);
        assert_eq!(counters.ops(), 1);
    }

    #[test]
    fn test_open_close_cycle() {
        let counters = GlobalCounters::new();
        counters.record_open();
        counters.record_open();
        assert_eq!(counters.ops(), 2);
        assert_eq!(counters.opened(), 2);

        counters.record_close();
        assert_eq!(counters.ops(), 2);
        assert_eq!(counters.opened(), 1);
    }

    #[test]
    fn test_transfer_accumulates() {
        let counters = GlobalCounters::new();
        counters.add_transfer(100, 40);
        counters.add_transfer(10, 2);
        assert_eq!(counters.cum_sent(), 110);
        assert_eq!(counters.cum_received(), 42);
    }
}
