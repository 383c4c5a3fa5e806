//! Read-only stats HTTP surface.
//!
//! Serves point-in-time samples of the registered pools, affinity maps
//! and listeners as JSON, plus a Prometheus-style text rendering under
//! `/metrics`. Strictly read-only; nothing on the data path waits on it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::modules::load_balancer::{AffinityMap, BackendPool, Selector};

use super::counters::GlobalCounters;

/// One backend's counters as reported by the stats surface.
#[derive(Debug, Serialize)]
struct BackendStats {
    ip: String,
    port: u16,
    weight: u32,
    active_conns: i64,
    total_conns: u64,
    total_bytes: u64,
}

/// One pool's backends.
#[derive(Debug, Serialize)]
struct PoolStats {
    host: String,
    port: u16,
    backends: Vec<BackendStats>,
    count: usize,
}

/// One affinity map's live bindings.
#[derive(Debug, Serialize)]
struct AffinityStats {
    host: String,
    ttl: String,
    entries: HashMap<String, String>,
    count: usize,
}

/// One listener's configuration and pool view.
#[derive(Debug, Serialize)]
struct PortStats {
    port: u16,
    host: String,
    algorithm: &'static str,
    pool: PoolStats,
}

struct PortRegistration {
    host: String,
    selector: Arc<dyn Selector>,
    pool: Arc<BackendPool>,
}

#[derive(Default)]
struct Registry {
    pools: HashMap<String, Arc<BackendPool>>,
    affinity_maps: HashMap<String, Arc<AffinityMap>>,
    ports: HashMap<u16, PortRegistration>,
}

/// The stats/management HTTP server.
pub struct StatsServer {
    registry: RwLock<Registry>,
    counters: Arc<GlobalCounters>,
}

impl StatsServer {
    /// Create a new stats server over the process counters.
    #[must_use]
    pub fn new(counters: Arc<GlobalCounters>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            counters,
        }
    }

    /// Register a backend pool under its `host:port` key.
    pub fn register_pool(&self, key: impl Into<String>, pool: Arc<BackendPool>) {
        self.registry
            .write()
            .expect("stats registry lock poisoned")
            .pools
            .insert(key.into(), pool);
    }

    /// Register an affinity map under its host.
    pub fn register_affinity_map(&self, host: impl Into<String>, map: Arc<AffinityMap>) {
        self.registry
            .write()
            .expect("stats registry lock poisoned")
            .affinity_maps
            .insert(host.into(), map);
    }

    /// Register a listener with its selector and pool.
    pub fn register_port(
        &self,
        port: u16,
        host: impl Into<String>,
        selector: Arc<dyn Selector>,
        pool: Arc<BackendPool>,
    ) {
        self.registry
            .write()
            .expect("stats registry lock poisoned")
            .ports
            .insert(
                port,
                PortRegistration {
                    host: host.into(),
                    selector,
                    pool,
                },
            );
    }

    /// Bind and serve on the given address until the process exits.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, error = %e, "Stats server failed to bind");
                return;
            }
        };
        info!(%addr, "Stats server started");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Stats server accept error");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let service =
                    service_fn(move |req| {
                        let server = Arc::clone(&server);
                        async move { server.handle(req) }
                    });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    warn!(error = %e, "Stats connection error");
                }
            });
        }
    }

    fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/health" => text_response("OK"),
            "/backends" => json_response(&self.pool_stats()),
            "/affinity" => json_response(&self.affinity_stats()),
            "/ports" => json_response(&self.port_stats()),
            "/metrics" => metrics_response(&self.render_metrics()),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"not found")))
                .expect("static response"),
        };
        Ok(response)
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        let registry = self.registry.read().expect("stats registry lock poisoned");
        registry.pools.values().map(|pool| pool_stats(pool)).collect()
    }

    fn affinity_stats(&self) -> Vec<AffinityStats> {
        let registry = self.registry.read().expect("stats registry lock poisoned");
        registry
            .affinity_maps
            .values()
            .map(|map| {
                let entries: HashMap<String, String> = map
                    .bindings()
                    .into_iter()
                    .map(|(src, backend)| (src.to_string(), backend.to_string()))
                    .collect();
                AffinityStats {
                    host: map.host().to_string(),
                    ttl: format!("{:?}", map.ttl()),
                    count: entries.len(),
                    entries,
                }
            })
            .collect()
    }

    fn port_stats(&self) -> Vec<PortStats> {
        let registry = self.registry.read().expect("stats registry lock poisoned");
        registry
            .ports
            .iter()
            .map(|(&port, reg)| PortStats {
                port,
                host: reg.host.clone(),
                algorithm: reg.selector.name(),
                pool: pool_stats(&reg.pool),
            })
            .collect()
    }

    fn render_metrics(&self) -> String {
        let registry = self.registry.read().expect("stats registry lock poisoned");
        let mut out = String::new();

        out.push_str("# HELP dnslb_connections_total Total connections handled\n");
        out.push_str("# TYPE dnslb_connections_total counter\n");
        out.push_str(&format!("dnslb_connections_total {}\n\n", self.counters.ops()));

        out.push_str("# HELP dnslb_connections_open Currently open connections\n");
        out.push_str("# TYPE dnslb_connections_open gauge\n");
        out.push_str(&format!("dnslb_connections_open {}\n\n", self.counters.opened()));

        out.push_str("# HELP dnslb_bytes_sent_total Cumulative bytes sent to clients\n");
        out.push_str("# TYPE dnslb_bytes_sent_total counter\n");
        out.push_str(&format!("dnslb_bytes_sent_total {}\n\n", self.counters.cum_sent()));

        out.push_str("# HELP dnslb_bytes_received_total Cumulative bytes received from clients\n");
        out.push_str("# TYPE dnslb_bytes_received_total counter\n");
        out.push_str(&format!(
            "dnslb_bytes_received_total {}\n\n",
            self.counters.cum_received()
        ));

        out.push_str("# HELP dnslb_pool_backends Backends currently in each pool\n");
        out.push_str("# TYPE dnslb_pool_backends gauge\n");
        for pool in registry.pools.values() {
            out.push_str(&format!(
                "dnslb_pool_backends{{host=\"{}\",port=\"{}\"}} {}\n",
                pool.host(),
                pool.backend_port(),
                pool.len()
            ));
        }
        out.push('\n');

        out.push_str("# HELP dnslb_backend_active_conns Active connections per backend\n");
        out.push_str("# TYPE dnslb_backend_active_conns gauge\n");
        for pool in registry.pools.values() {
            for backend in pool.snapshot() {
                out.push_str(&format!(
                    "dnslb_backend_active_conns{{host=\"{}\",ip=\"{}\"}} {}\n",
                    pool.host(),
                    backend.ip(),
                    backend.active_conns()
                ));
            }
        }
        out.push('\n');

        out.push_str("# HELP dnslb_backend_connections_total Total connections per backend\n");
        out.push_str("# TYPE dnslb_backend_connections_total counter\n");
        for pool in registry.pools.values() {
            for backend in pool.snapshot() {
                out.push_str(&format!(
                    "dnslb_backend_connections_total{{host=\"{}\",ip=\"{}\"}} {}\n",
                    pool.host(),
                    backend.ip(),
                    backend.total_conns()
                ));
            }
        }
        out.push('\n');

        out.push_str("# HELP dnslb_backend_bytes_total Total bytes transferred per backend\n");
        out.push_str("# TYPE dnslb_backend_bytes_total counter\n");
        for pool in registry.pools.values() {
            for backend in pool.snapshot() {
                out.push_str(&format!(
                    "dnslb_backend_bytes_total{{host=\"{}\",ip=\"{}\"}} {}\n",
                    pool.host(),
                    backend.ip(),
                    backend.total_bytes()
                ));
            }
        }
        out.push('\n');

        out.push_str("# HELP dnslb_backend_weight Configured weight per backend\n");
        out.push_str("# TYPE dnslb_backend_weight gauge\n");
        for pool in registry.pools.values() {
            for backend in pool.snapshot() {
                out.push_str(&format!(
                    "dnslb_backend_weight{{host=\"{}\",ip=\"{}\"}} {}\n",
                    pool.host(),
                    backend.ip(),
                    backend.weight()
                ));
            }
        }
        out.push('\n');

        out.push_str("# HELP dnslb_affinity_entries Affinity bindings per host\n");
        out.push_str("# TYPE dnslb_affinity_entries gauge\n");
        for map in registry.affinity_maps.values() {
            out.push_str(&format!(
                "dnslb_affinity_entries{{host=\"{}\"}} {}\n",
                map.host(),
                map.len()
            ));
        }

        out
    }
}

fn pool_stats(pool: &BackendPool) -> PoolStats {
    let backends: Vec<BackendStats> = pool
        .snapshot()
        .iter()
        .map(|b| BackendStats {
            ip: b.ip().to_string(),
            port: b.port(),
            weight: b.weight(),
            active_conns: b.active_conns(),
            total_conns: b.total_conns(),
            total_bytes: b.total_bytes(),
        })
        .collect();
    PoolStats {
        host: pool.host().to_string(),
        port: pool.backend_port(),
        count: backends.len(),
        backends,
    }
}

fn text_response(body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response")
}

fn metrics_response(body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}

fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("static response"),
        Err(e) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::from(e.to_string())))
            .expect("static response"),
    }
}
