//! Backend pool management.
//!
//! A [`BackendPool`] holds the live set of backends for one logical
//! `(host, backend_port)` pair. Membership is driven by the DNS probe
//! loop through [`BackendPool::apply_ip_set`]; per-backend counters are
//! updated by the forwarders on every connection.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, info};

/// A single upstream instance resolved from DNS.
#[derive(Debug)]
pub struct Backend {
    /// Resolved address. Immutable for the lifetime of the backend.
    ip: IpAddr,
    /// Port this backend is reached on.
    port: u16,
    /// Explicit weight for weighted algorithms (default 1).
    weight: AtomicU32,
    /// Currently active connections.
    active_conns: AtomicI64,
    /// Total connections served.
    total_conns: AtomicU64,
    /// Total bytes transferred.
    total_bytes: AtomicU64,
    /// Last time the DNS probe saw this address.
    last_seen: RwLock<Instant>,
}

impl Backend {
    fn new(ip: IpAddr, port: u16, weight: u32) -> Self {
        Self {
            ip,
            port,
            weight: AtomicU32::new(weight),
            active_conns: AtomicI64::new(0),
            total_conns: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_seen: RwLock::new(Instant::now()),
        }
    }

    /// Get the backend IP.
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Get the backend port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the full socket address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Get the explicit weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Get the active connection count.
    #[must_use]
    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    /// Get the total connection count.
    #[must_use]
    pub fn total_conns(&self) -> u64 {
        self.total_conns.load(Ordering::Relaxed)
    }

    /// Get the total bytes transferred.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Get the last DNS probe time that saw this backend.
    #[must_use]
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.read().expect("last_seen lock poisoned")
    }

    fn mark_seen(&self, now: Instant) {
        *self.last_seen.write().expect("last_seen lock poisoned") = now;
    }
}

/// Membership state guarded by the pool lock.
///
/// The snapshot list and the map always hold the same set of backends.
#[derive(Debug, Default)]
struct PoolInner {
    backends: HashMap<IpAddr, Arc<Backend>>,
    snapshot: Vec<Arc<Backend>>,
}

/// The set of backends for one logical host and backend port.
#[derive(Debug)]
pub struct BackendPool {
    host: String,
    backend_port: u16,
    inner: RwLock<PoolInner>,
    /// Pool-global round-robin cursor, shared by every listener on this pool.
    round_robin: AtomicU64,
    /// Weights from `--backend-weights`, applied to known backends and to
    /// backends discovered later.
    configured_weights: RwLock<HashMap<IpAddr, u32>>,
}

impl BackendPool {
    /// Create a new empty pool.
    #[must_use]
    pub fn new(host: impl Into<String>, backend_port: u16) -> Self {
        Self {
            host: host.into(),
            backend_port,
            inner: RwLock::new(PoolInner::default()),
            round_robin: AtomicU64::new(0),
            configured_weights: RwLock::new(HashMap::new()),
        }
    }

    /// Get the logical host this pool serves.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the backend port.
    #[must_use]
    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }

    /// Look up a backend by IP.
    #[must_use]
    pub fn get(&self, ip: IpAddr) -> Option<Arc<Backend>> {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .backends
            .get(&ip)
            .cloned()
    }

    /// Check whether an IP is a current member of the pool.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .backends
            .contains_key(&ip)
    }

    /// Get a point-in-time copy of the backend list.
    ///
    /// Callers must treat the returned list as immutable; selection over
    /// a snapshot never contends with DNS updates.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .snapshot
            .clone()
    }

    /// Get the number of backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("pool lock poisoned").backends.len()
    }

    /// Check whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .backends
            .is_empty()
    }

    /// Record a new connection to a backend.
    pub fn on_connect(&self, backend: &Backend) {
        backend.active_conns.fetch_add(1, Ordering::Relaxed);
        backend.total_conns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection.
    pub fn on_disconnect(&self, backend: &Backend) {
        backend.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    /// Add transferred bytes to a backend's counter.
    pub fn add_bytes(&self, backend: &Backend, bytes: u64) {
        backend.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Advance and return the pool-global round-robin cursor.
    #[must_use]
    pub fn next_round_robin(&self) -> u64 {
        self.round_robin
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Apply a freshly resolved IP set to the pool.
    ///
    /// New addresses become backends (weight from `--backend-weights`,
    /// otherwise 1, counters zero); addresses still present are marked
    /// seen; addresses gone from DNS are removed immediately, counters
    /// and all. The snapshot list is rebuilt only when membership
    /// actually changed.
    pub fn apply_ip_set(&self, ips: &[IpAddr]) {
        let configured = self
            .configured_weights
            .read()
            .expect("weights lock poisoned");
        let mut inner = self.inner.write().expect("pool lock poisoned");
        let now = Instant::now();
        let mut changed = 0usize;

        for &ip in ips {
            if let Some(backend) = inner.backends.get(&ip) {
                backend.mark_seen(now);
            } else {
                changed += 1;
                info!(host = %self.host, %ip, "New backend");
                let weight = configured.get(&ip).copied().unwrap_or(1);
                inner
                    .backends
                    .insert(ip, Arc::new(Backend::new(ip, self.backend_port, weight)));
            }
        }

        let lost: Vec<IpAddr> = inner
            .backends
            .values()
            .filter(|b| b.last_seen() < now)
            .map(|b| b.ip())
            .collect();
        for ip in lost {
            changed += 1;
            info!(host = %self.host, %ip, "Lost backend");
            inner.backends.remove(&ip);
        }

        if changed != 0 {
            inner.snapshot = inner.backends.values().cloned().collect();
            info!(host = %self.host, count = inner.snapshot.len(), "Backend list updated");
        }
    }

    /// Set explicit weights for backends.
    ///
    /// Applies to currently known backends (unknown IPs are kept for
    /// addresses DNS discovers later).
    pub fn set_weights(&self, weights: &HashMap<IpAddr, u32>) {
        let inner = self.inner.read().expect("pool lock poisoned");
        for (&ip, &weight) in weights {
            if let Some(backend) = inner.backends.get(&ip) {
                backend.weight.store(weight, Ordering::Relaxed);
                info!(host = %self.host, %ip, weight, "Backend weight set");
            } else {
                debug!(host = %self.host, %ip, weight, "Weight kept for undiscovered backend");
            }
        }
        drop(inner);

        self.configured_weights
            .write()
            .expect("weights lock poisoned")
            .extend(weights.iter().map(|(&ip, &w)| (ip, w)));
    }
}

/// Brackets one forwarded connection against its backend.
///
/// Records the connect on creation; the drop releases the backend and
/// refreshes affinity on every exit path, so a dial failure or a
/// mid-transfer error never leaks a counter.
#[derive(Debug)]
pub struct ConnectionGuard {
    pool: Arc<BackendPool>,
    backend: Arc<Backend>,
    affinity: Option<Arc<super::affinity::AffinityMap>>,
    source_ip: Option<IpAddr>,
}

impl ConnectionGuard {
    /// Record a connect and return the guard that records the disconnect.
    #[must_use]
    pub fn connect(
        pool: &Arc<BackendPool>,
        backend: &Arc<Backend>,
        affinity: Option<&Arc<super::affinity::AffinityMap>>,
        source_ip: Option<IpAddr>,
    ) -> Self {
        pool.on_connect(backend);
        Self {
            pool: Arc::clone(pool),
            backend: Arc::clone(backend),
            affinity: affinity.cloned(),
            source_ip,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.pool.on_disconnect(&self.backend);
        if let (Some(affinity), Some(source_ip)) = (&self.affinity, self.source_ip) {
            affinity.touch(source_ip);
        }
    }
}
