//! Backend selection policies.
//!
//! Every selector observes the same two-step rule: an affinity hit that
//! still names a pool member bypasses the algorithm entirely; otherwise
//! the algorithm runs over a pool snapshot and, when affinity is active,
//! records its choice.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;

use super::affinity::AffinityMap;
use super::backend::{Backend, BackendPool};
use super::error::{LoadBalancerError, LoadBalancerResult};

/// A backend selection policy.
pub trait Selector: Send + Sync {
    /// Select a backend from the pool for the given source.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::NoBackends`] when the pool is empty.
    fn select(
        &self,
        pool: &BackendPool,
        source_ip: Option<IpAddr>,
        affinity: Option<&AffinityMap>,
    ) -> LoadBalancerResult<Arc<Backend>>;

    /// Get the policy name for logging and stats.
    fn name(&self) -> &'static str;
}

/// Create a selector from an algorithm name.
///
/// `explicit_weights` switches weighted-random from the implicit
/// connection-count inversion to the configured per-backend weights.
///
/// # Errors
///
/// Returns [`LoadBalancerError::UnknownAlgorithm`] for unrecognized names.
pub fn make_selector(
    algorithm: &str,
    explicit_weights: bool,
) -> LoadBalancerResult<Arc<dyn Selector>> {
    match algorithm {
        "random" => Ok(Arc::new(RandomSelector)),
        "round-robin" => Ok(Arc::new(RoundRobinSelector)),
        "least-connection" => Ok(Arc::new(LeastConnectionSelector)),
        "weighted-random" => Ok(Arc::new(WeightedRandomSelector { explicit_weights })),
        other => Err(LoadBalancerError::UnknownAlgorithm(other.to_string())),
    }
}

/// Return the affinity-bound backend if it is still a pool member.
fn affinity_hit(
    pool: &BackendPool,
    source_ip: Option<IpAddr>,
    affinity: Option<&AffinityMap>,
) -> Option<Arc<Backend>> {
    let backend_ip = affinity?.get(source_ip?)?;
    pool.get(backend_ip)
}

/// Record an algorithmic choice in the affinity map.
fn remember(source_ip: Option<IpAddr>, affinity: Option<&AffinityMap>, backend: &Backend) {
    if let (Some(source_ip), Some(affinity)) = (source_ip, affinity) {
        affinity.set(source_ip, backend.ip());
    }
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(
        &self,
        pool: &BackendPool,
        source_ip: Option<IpAddr>,
        affinity: Option<&AffinityMap>,
    ) -> LoadBalancerResult<Arc<Backend>> {
        if let Some(backend) = affinity_hit(pool, source_ip, affinity) {
            return Ok(backend);
        }

        let backends = pool.snapshot();
        if backends.is_empty() {
            return Err(LoadBalancerError::NoBackends(pool.host().to_string()));
        }

        let n = rand::rng().random_range(0..backends.len());
        let selected = Arc::clone(&backends[n]);
        remember(source_ip, affinity, &selected);
        Ok(selected)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Rotating selection over the pool-global cursor.
///
/// The cursor lives in the pool, not the selector, so every listener
/// sharing a pool participates in the same rotation.
#[derive(Debug, Default)]
pub struct RoundRobinSelector;

impl Selector for RoundRobinSelector {
    fn select(
        &self,
        pool: &BackendPool,
        source_ip: Option<IpAddr>,
        affinity: Option<&AffinityMap>,
    ) -> LoadBalancerResult<Arc<Backend>> {
        if let Some(backend) = affinity_hit(pool, source_ip, affinity) {
            return Ok(backend);
        }

        let backends = pool.snapshot();
        if backends.is_empty() {
            return Err(LoadBalancerError::NoBackends(pool.host().to_string()));
        }

        let idx = (pool.next_round_robin() % backends.len() as u64) as usize;
        let selected = Arc::clone(&backends[idx]);
        remember(source_ip, affinity, &selected);
        Ok(selected)
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Selection of the backend with the fewest active connections.
///
/// Ties are broken uniformly at random so simultaneous idle backends do
/// not all receive the next burst of connections.
#[derive(Debug, Default)]
pub struct LeastConnectionSelector;

impl Selector for LeastConnectionSelector {
    fn select(
        &self,
        pool: &BackendPool,
        source_ip: Option<IpAddr>,
        affinity: Option<&AffinityMap>,
    ) -> LoadBalancerResult<Arc<Backend>> {
        if let Some(backend) = affinity_hit(pool, source_ip, affinity) {
            return Ok(backend);
        }

        let backends = pool.snapshot();
        if backends.is_empty() {
            return Err(LoadBalancerError::NoBackends(pool.host().to_string()));
        }

        let min = backends
            .iter()
            .map(|b| b.active_conns())
            .min()
            .unwrap_or(0);
        let candidates: Vec<&Arc<Backend>> = backends
            .iter()
            .filter(|b| b.active_conns() == min)
            .collect();

        let n = rand::rng().random_range(0..candidates.len());
        let selected = Arc::clone(candidates[n]);
        remember(source_ip, affinity, &selected);
        Ok(selected)
    }

    fn name(&self) -> &'static str {
        "least-connection"
    }
}

/// Weighted random selection.
///
/// With explicit weights, each backend's probability is proportional to
/// its configured weight. Without, weights are derived from connection
/// counts: `(max_active - active + 1) * weight`, so lightly loaded
/// backends dominate while loaded ones keep a non-zero share.
#[derive(Debug)]
pub struct WeightedRandomSelector {
    /// Use configured weights instead of connection-count inversion.
    pub explicit_weights: bool,
}

impl Selector for WeightedRandomSelector {
    fn select(
        &self,
        pool: &BackendPool,
        source_ip: Option<IpAddr>,
        affinity: Option<&AffinityMap>,
    ) -> LoadBalancerResult<Arc<Backend>> {
        if let Some(backend) = affinity_hit(pool, source_ip, affinity) {
            return Ok(backend);
        }

        let backends = pool.snapshot();
        if backends.is_empty() {
            return Err(LoadBalancerError::NoBackends(pool.host().to_string()));
        }

        let weights: Vec<u64> = if self.explicit_weights {
            backends.iter().map(|b| u64::from(b.weight())).collect()
        } else {
            let max_conns = backends
                .iter()
                .map(|b| b.active_conns())
                .max()
                .unwrap_or(0);
            backends
                .iter()
                .map(|b| {
                    let inverted = (max_conns - b.active_conns()).max(0) as u64 + 1;
                    inverted * u64::from(b.weight())
                })
                .collect()
        };

        let total: u64 = weights.iter().sum();
        let selected = if total == 0 {
            // All weights zero: fall back to uniform random.
            let n = rand::rng().random_range(0..backends.len());
            Arc::clone(&backends[n])
        } else {
            let mut r = rand::rng().random_range(0..total);
            let mut picked = None;
            for (backend, &weight) in backends.iter().zip(&weights) {
                if r < weight {
                    picked = Some(Arc::clone(backend));
                    break;
                }
                r -= weight;
            }
            picked.unwrap_or_else(|| Arc::clone(&backends[backends.len() - 1]))
        };

        remember(source_ip, affinity, &selected);
        Ok(selected)
    }

    fn name(&self) -> &'static str {
        "weighted-random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn pool_with(addrs: &[&str]) -> BackendPool {
        let pool = BackendPool::new("backends", 9000);
        let ips: Vec<IpAddr> = addrs.iter().map(|a| a.parse().unwrap()).collect();
        pool.apply_ip_set(&ips);
        pool
    }

    fn three_backend_pool() -> BackendPool {
        pool_with(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])
    }

    fn tally(pool: &BackendPool, selector: &dyn Selector, trials: usize) -> HashMap<IpAddr, usize> {
        let mut counts = HashMap::new();
        for _ in 0..trials {
            let backend = selector.select(pool, None, None).unwrap();
            *counts.entry(backend.ip()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_all_selectors_fail_on_empty_pool() {
        let pool = BackendPool::new("backends", 9000);
        for name in ["random", "round-robin", "least-connection", "weighted-random"] {
            let selector = make_selector(name, false).unwrap();
            assert!(matches!(
                selector.select(&pool, None, None),
                Err(LoadBalancerError::NoBackends(_))
            ));
        }
    }

    #[test]
    fn test_make_selector_rejects_unknown_algorithm() {
        assert!(matches!(
            make_selector("fastest", false),
            Err(LoadBalancerError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_selector_names() {
        assert_eq!(make_selector("random", false).unwrap().name(), "random");
        assert_eq!(
            make_selector("round-robin", false).unwrap().name(),
            "round-robin"
        );
        assert_eq!(
            make_selector("least-connection", false).unwrap().name(),
            "least-connection"
        );
        assert_eq!(
            make_selector("weighted-random", true).unwrap().name(),
            "weighted-random"
        );
    }

    #[test]
    fn test_random_is_roughly_uniform() {
        // A ±1% band is only ~2 sigma at 10k draws; 100k draws put it
        // past 6 sigma so a single run stays inside it.
        const TRIALS: usize = 100_000;
        let pool = three_backend_pool();
        let counts = tally(&pool, &RandomSelector, TRIALS);

        for (_, &count) in &counts {
            let freq = count as f64 / TRIALS as f64;
            assert!(
                (freq - 1.0 / 3.0).abs() < 0.01,
                "frequency {freq} too far from 1/3"
            );
        }
    }

    #[test]
    fn test_round_robin_rotates_exactly() {
        let pool = three_backend_pool();
        let selector = RoundRobinSelector;

        let picks: Vec<IpAddr> = (0..6)
            .map(|_| selector.select(&pool, None, None).unwrap().ip())
            .collect();

        // Each backend exactly twice, consistent rotation, no repeats.
        let mut counts = HashMap::new();
        for ip in &picks {
            *counts.entry(*ip).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 2));
        for pair in picks.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(&picks[..3], &picks[3..]);
    }

    #[test]
    fn test_least_connection_pins_to_minimum() {
        let pool = three_backend_pool();
        let backends = pool.snapshot();
        let loads = [5i64, 2, 10];
        for (backend, &load) in backends.iter().zip(&loads) {
            for _ in 0..load {
                pool.on_connect(backend);
            }
        }

        let selector = LeastConnectionSelector;
        let least = backends[1].ip();
        for _ in 0..100 {
            assert_eq!(selector.select(&pool, None, None).unwrap().ip(), least);
        }
    }

    #[test]
    fn test_least_connection_tie_break_spreads() {
        let pool = three_backend_pool();
        let counts = tally(&pool, &LeastConnectionSelector, 50);
        assert!(counts.len() >= 2, "tie-break should hit distinct backends");
    }

    #[test]
    fn test_weighted_random_implicit_prefers_light_backends() {
        let pool = three_backend_pool();
        let backends = pool.snapshot();
        let loads = [5i64, 2, 10];
        for (backend, &load) in backends.iter().zip(&loads) {
            for _ in 0..load {
                pool.on_connect(backend);
            }
        }

        let selector = WeightedRandomSelector {
            explicit_weights: false,
        };
        let counts = tally(&pool, &selector, 10_000);
        let lightest = counts.get(&backends[1].ip()).copied().unwrap_or(0);
        let heaviest = counts.get(&backends[2].ip()).copied().unwrap_or(0);
        assert!(
            lightest > heaviest,
            "lightest backend got {lightest}, heaviest {heaviest}"
        );
        // The loaded backend still keeps a non-zero share.
        assert!(heaviest > 0);
    }

    #[test]
    fn test_weighted_random_explicit_follows_weights() {
        let pool = three_backend_pool();
        let backends = pool.snapshot();
        let mut weights = HashMap::new();
        weights.insert(backends[0].ip(), 100u32);
        weights.insert(backends[1].ip(), 50u32);
        weights.insert(backends[2].ip(), 10u32);
        pool.set_weights(&weights);

        let selector = WeightedRandomSelector {
            explicit_weights: true,
        };
        let counts = tally(&pool, &selector, 10_000);
        let first = counts.get(&backends[0].ip()).copied().unwrap_or(0);
        let second = counts.get(&backends[1].ip()).copied().unwrap_or(0);
        let third = counts.get(&backends[2].ip()).copied().unwrap_or(0);
        assert!(first > second && second > third, "{first} {second} {third}");
    }

    #[test]
    fn test_weighted_random_zero_total_falls_back_to_uniform() {
        let pool = three_backend_pool();
        let weights: HashMap<IpAddr, u32> =
            pool.snapshot().iter().map(|b| (b.ip(), 0u32)).collect();
        pool.set_weights(&weights);

        let selector = WeightedRandomSelector {
            explicit_weights: true,
        };
        let counts = tally(&pool, &selector, 300);
        assert_eq!(counts.len(), 3, "all backends should still be reachable");
    }

    #[test]
    fn test_affinity_hit_bypasses_algorithm() {
        let pool = three_backend_pool();
        let affinity = AffinityMap::new("backends", Duration::from_secs(60));
        let source: IpAddr = "192.0.2.7".parse().unwrap();
        let pinned = pool.snapshot()[2].ip();
        affinity.set(source, pinned);

        let selector = RandomSelector;
        for _ in 0..50 {
            let backend = selector
                .select(&pool, Some(source), Some(&affinity))
                .unwrap();
            assert_eq!(backend.ip(), pinned);
        }
    }

    #[test]
    fn test_affinity_ignored_when_backend_left_pool() {
        let pool = pool_with(&["10.0.0.1"]);
        let affinity = AffinityMap::new("backends", Duration::from_secs(60));
        let source: IpAddr = "192.0.2.7".parse().unwrap();
        affinity.set(source, "10.0.0.9".parse().unwrap());

        let selector = RandomSelector;
        let backend = selector
            .select(&pool, Some(source), Some(&affinity))
            .unwrap();
        assert_eq!(backend.ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
        // The algorithmic pick replaced the dangling binding.
        assert_eq!(affinity.get(source), Some(backend.ip()));
    }

    #[test]
    fn test_algorithm_records_affinity() {
        let pool = three_backend_pool();
        let affinity = AffinityMap::new("backends", Duration::from_secs(60));
        let source: IpAddr = "192.0.2.8".parse().unwrap();

        let selector = RoundRobinSelector;
        let first = selector
            .select(&pool, Some(source), Some(&affinity))
            .unwrap();
        // Subsequent selections stick to the recorded backend.
        for _ in 0..10 {
            let again = selector
                .select(&pool, Some(source), Some(&affinity))
                .unwrap();
            assert_eq!(again.ip(), first.ip());
        }
    }
}
