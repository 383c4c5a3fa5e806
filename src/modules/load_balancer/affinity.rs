//! Source-IP affinity tracking.
//!
//! An [`AffinityMap`] binds client source IPs to backend IPs for a
//! bounded time. Entries self-expire on [`AffinityMap::get`] so callers
//! observe the TTL precisely; a background sweeper additionally removes
//! stale entries every `ttl / 2` to bound memory.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// One source-IP binding.
#[derive(Debug, Clone)]
struct AffinityEntry {
    backend_ip: IpAddr,
    last_used: Instant,
}

/// Source IP to backend IP bindings with TTL, one per logical host.
#[derive(Debug)]
pub struct AffinityMap {
    host: String,
    ttl: Duration,
    entries: RwLock<HashMap<IpAddr, AffinityEntry>>,
}

impl AffinityMap {
    /// Create a new affinity map.
    #[must_use]
    pub fn new(host: impl Into<String>, ttl: Duration) -> Self {
        Self {
            host: host.into(),
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the logical host this map belongs to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up the backend bound to a source IP.
    ///
    /// Entries older than the TTL are treated as misses.
    #[must_use]
    pub fn get(&self, source_ip: IpAddr) -> Option<IpAddr> {
        let entries = self.entries.read().expect("affinity lock poisoned");
        let entry = entries.get(&source_ip)?;
        if entry.last_used.elapsed() > self.ttl {
            return None;
        }
        Some(entry.backend_ip)
    }

    /// Create or update a binding for a source IP.
    pub fn set(&self, source_ip: IpAddr, backend_ip: IpAddr) {
        let mut entries = self.entries.write().expect("affinity lock poisoned");
        let now = Instant::now();
        match entries.get_mut(&source_ip) {
            Some(entry) => {
                entry.backend_ip = backend_ip;
                entry.last_used = now;
            }
            None => {
                debug!(host = %self.host, %source_ip, %backend_ip, "Affinity created");
                entries.insert(
                    source_ip,
                    AffinityEntry {
                        backend_ip,
                        last_used: now,
                    },
                );
            }
        }
    }

    /// Refresh a binding's timestamp.
    ///
    /// Called when a connection closes, so active sessions keep their
    /// binding while the client stays connected.
    pub fn touch(&self, source_ip: IpAddr) {
        let mut entries = self.entries.write().expect("affinity lock poisoned");
        if let Some(entry) = entries.get_mut(&source_ip) {
            entry.last_used = Instant::now();
            debug!(host = %self.host, %source_ip, backend_ip = %entry.backend_ip, "Affinity touched");
        }
    }

    /// Get the current number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("affinity lock poisoned").len()
    }

    /// Check whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .expect("affinity lock poisoned")
            .is_empty()
    }

    /// Get a copy of all live bindings, for the stats surface.
    #[must_use]
    pub fn bindings(&self) -> Vec<(IpAddr, IpAddr)> {
        self.entries
            .read()
            .expect("affinity lock poisoned")
            .iter()
            .map(|(&src, entry)| (src, entry.backend_ip))
            .collect()
    }

    /// Remove every entry older than the TTL. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().expect("affinity lock poisoned");
        let before = entries.len();
        entries.retain(|source_ip, entry| {
            let live = entry.last_used.elapsed() <= self.ttl;
            if !live {
                debug!(host = %self.host, %source_ip, backend_ip = %entry.backend_ip, "Affinity expired");
            }
            live
        });
        before - entries.len()
    }

    /// Run the background sweeper, evicting expired entries every `ttl / 2`.
    pub async fn run_sweeper(self: Arc<Self>) {
        let period = self.ttl / 2;
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = self.sweep_expired();
            if removed > 0 {
                info!(host = %self.host, removed, remaining = self.len(), "Affinity cleanup");
            }
        }
    }
}
