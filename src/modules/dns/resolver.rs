//! Periodic DNS resolution with subscriber fan-out.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::modules::load_balancer::BackendPool;

/// A component interested in the resolved IP set of a host.
///
/// Subscribers receive the full new set on every change, not deltas,
/// including transitions to and from the empty set.
pub trait DnsSubscriber: Send + Sync {
    /// Called with the complete new IP set after a changed probe round.
    fn on_dns_update(&self, ips: &[IpAddr]);
}

impl DnsSubscriber for BackendPool {
    fn on_dns_update(&self, ips: &[IpAddr]) {
        self.apply_ip_set(ips);
    }
}

#[derive(Default)]
struct ResolverInner {
    ips: Vec<IpAddr>,
    subscribers: Vec<Arc<dyn DnsSubscriber>>,
}

/// Periodic resolver for a single hostname.
///
/// Multiple pools can subscribe to one resolver when several mappings
/// share a host. Subscribers are never invoked under the resolver lock.
pub struct DnsResolver {
    host: String,
    probe_period: Duration,
    inner: RwLock<ResolverInner>,
}

impl DnsResolver {
    /// Create a new resolver for a hostname.
    #[must_use]
    pub fn new(host: impl Into<String>, probe_period: Duration) -> Self {
        Self {
            host: host.into(),
            probe_period,
            inner: RwLock::new(ResolverInner::default()),
        }
    }

    /// Get the resolved hostname.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get a copy of the most recently resolved IP set.
    #[must_use]
    pub fn current_ips(&self) -> Vec<IpAddr> {
        self.inner.read().expect("resolver lock poisoned").ips.clone()
    }

    /// Register a subscriber for IP-set updates.
    ///
    /// If a probe round has already produced addresses, the subscriber is
    /// brought up to date immediately.
    pub fn subscribe(&self, subscriber: Arc<dyn DnsSubscriber>) {
        let current = {
            let mut inner = self.inner.write().expect("resolver lock poisoned");
            inner.subscribers.push(Arc::clone(&subscriber));
            inner.ips.clone()
        };
        if !current.is_empty() {
            subscriber.on_dns_update(&current);
        }
    }

    /// Run the probe loop. The first round resolves immediately.
    pub async fn run(self: Arc<Self>) {
        info!(host = %self.host, probe_period = ?self.probe_period, "DNS resolver started");
        let mut round = 0u64;
        loop {
            if round != 0 {
                tokio::time::sleep(self.probe_period).await;
            }
            round += 1;
            debug!(host = %self.host, round, "DNS probing");

            let ips = match lookup(&self.host).await {
                Ok(ips) => ips,
                Err(e) => {
                    error!(host = %self.host, error = %e, "DNS lookup failed");
                    continue;
                }
            };

            if self.update_ips(&ips) {
                let subscribers = self.subscribers();
                info!(
                    host = %self.host,
                    ips = ips.len(),
                    subscribers = subscribers.len(),
                    "DNS resolved"
                );
                for subscriber in subscribers {
                    subscriber.on_dns_update(&ips);
                }
            }
        }
    }

    /// Store the new IP set; returns whether it differs from the last one.
    fn update_ips(&self, new_ips: &[IpAddr]) -> bool {
        let mut inner = self.inner.write().expect("resolver lock poisoned");
        let old: HashSet<IpAddr> = inner.ips.iter().copied().collect();
        let changed =
            inner.ips.len() != new_ips.len() || new_ips.iter().any(|ip| !old.contains(ip));
        if changed {
            inner.ips = new_ips.to_vec();
        }
        changed
    }

    fn subscribers(&self) -> Vec<Arc<dyn DnsSubscriber>> {
        self.inner
            .read()
            .expect("resolver lock poisoned")
            .subscribers
            .clone()
    }
}

/// Resolve a hostname to its unique addresses.
async fn lookup(host: &str) -> std::io::Result<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host, 0u16)).await?;
    let mut seen = HashSet::new();
    Ok(addrs
        .map(|addr| addr.ip())
        .filter(|ip| seen.insert(*ip))
        .collect())
}
