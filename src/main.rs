//! dnslb binary entry point.
//!
//! Parses the CLI, wires resolvers, pools, affinity maps and selectors
//! together per mapping, then spawns one listener task per expanded
//! mapping and parks until interrupted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_rustls::rustls::ServerConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dnslb::config::{parse_backend_weights, parse_mapping, ForwardMode, PortMapping, ProxyDefaults, ProxyVersion};
use dnslb::modules::dns::DnsResolver;
use dnslb::modules::http_handler::HttpForwarder;
use dnslb::modules::load_balancer::{make_selector, AffinityMap, BackendPool};
use dnslb::modules::stats::{GlobalCounters, StatsServer};
use dnslb::modules::tcp_router::TcpForwarder;
use dnslb::modules::tls_terminator::{generate_self_signed, load_server_config};

/// Fallback TTL when a mapping enables affinity but the global TTL is zero.
const DEFAULT_AFFINITY_TTL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "dnslb",
    version,
    about = "DNS-backed L4/L7 load balancer",
    arg_required_else_help = true
)]
struct Args {
    /// Port mappings: [listen[-listen2]:]host:backend[-backend2][,option]*
    ///
    /// Options: http, https, affinity, lb=<algorithm>,
    /// proxy-server=v1|v2, proxy-client=v1|v2
    #[arg(required = true, value_name = "MAPPING")]
    mappings: Vec<String>,

    /// DNS probe period
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    probe_period: Duration,

    /// Verbose mode
    #[arg(long)]
    verbose: bool,

    /// Load balancing algorithm: random, round-robin, least-connection,
    /// weighted-random
    #[arg(long, default_value = "random")]
    lb_algorithm: String,

    /// IP affinity TTL (0 to disable)
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    affinity_ttl: Duration,

    /// Backend weights: host:ip1=weight1,ip2=weight2;host2:...
    #[arg(long, default_value = "")]
    backend_weights: String,

    /// Stats/management API port (empty to disable)
    #[arg(long, default_value = "8080")]
    stats_port: String,

    /// TLS certificate file
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS key file
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable PROXY protocol v1 ingest on all mappings (deprecated; use
    /// the per-mapping proxy-server option)
    #[arg(long)]
    server_proxy_protocol: bool,

    /// Send PROXY protocol v1 to backends on all mappings (deprecated;
    /// use the per-mapping proxy-client option)
    #[arg(long)]
    client_proxy_protocol: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "info,dnslb=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting dnslb");

    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let weights = parse_backend_weights(&args.backend_weights);
    let defaults = ProxyDefaults {
        server: args.server_proxy_protocol.then_some(ProxyVersion::V1),
        client: args.client_proxy_protocol.then_some(ProxyVersion::V1),
    };

    let mut mappings: Vec<PortMapping> = Vec::new();
    for arg in &args.mappings {
        mappings.extend(parse_mapping(arg, defaults).with_context(|| format!("argument '{arg}'"))?);
    }

    let counters = Arc::new(GlobalCounters::new());
    let stats = Arc::new(StatsServer::new(Arc::clone(&counters)));
    if !args.stats_port.is_empty() {
        let port: u16 = args
            .stats_port
            .parse()
            .with_context(|| format!("invalid stats port '{}'", args.stats_port))?;
        tokio::spawn(Arc::clone(&stats).run(SocketAddr::from(([0, 0, 0, 0], port))));
    }

    let mut resolvers: HashMap<String, Arc<DnsResolver>> = HashMap::new();
    let mut pools: HashMap<String, Arc<BackendPool>> = HashMap::new();
    let mut affinity_maps: HashMap<String, Arc<AffinityMap>> = HashMap::new();
    let mut tls_config: Option<Arc<ServerConfig>> = None;

    for mapping in mappings {
        // One resolver per host, shared by every pool on that host.
        let resolver = resolvers
            .entry(mapping.host.clone())
            .or_insert_with(|| {
                let resolver = Arc::new(DnsResolver::new(mapping.host.clone(), args.probe_period));
                tokio::spawn(Arc::clone(&resolver).run());
                resolver
            })
            .clone();

        // One pool per (host, backend_port).
        let pool_key = format!("{}:{}", mapping.host, mapping.backend_port);
        let pool = pools
            .entry(pool_key.clone())
            .or_insert_with(|| {
                let pool = Arc::new(BackendPool::new(mapping.host.clone(), mapping.backend_port));
                if let Some(host_weights) = weights.get(&mapping.host) {
                    pool.set_weights(host_weights);
                }
                info!(host = %mapping.host, port = mapping.backend_port, "Starting DNS probe");
                resolver.subscribe(pool.clone());
                stats.register_pool(pool_key.as_str(), Arc::clone(&pool));
                pool
            })
            .clone();

        // One affinity map per host, created on first mapping that asks.
        let affinity = if mapping.affinity_enabled {
            Some(
                affinity_maps
                    .entry(mapping.host.clone())
                    .or_insert_with(|| {
                        let ttl = if args.affinity_ttl.is_zero() {
                            DEFAULT_AFFINITY_TTL
                        } else {
                            args.affinity_ttl
                        };
                        let map = Arc::new(AffinityMap::new(mapping.host.clone(), ttl));
                        info!(host = %mapping.host, ?ttl, "IP affinity enabled");
                        tokio::spawn(Arc::clone(&map).run_sweeper());
                        stats.register_affinity_map(mapping.host.as_str(), Arc::clone(&map));
                        map
                    })
                    .clone(),
            )
        } else {
            None
        };

        let algorithm = mapping
            .algorithm
            .as_deref()
            .unwrap_or(&args.lb_algorithm);
        let has_explicit_weights = weights.contains_key(&mapping.host);
        let selector = make_selector(algorithm, has_explicit_weights)
            .with_context(|| format!("mapping on port {}", mapping.listen_port))?;
        stats.register_port(
            mapping.listen_port,
            mapping.host.as_str(),
            Arc::clone(&selector),
            Arc::clone(&pool),
        );

        match mapping.mode {
            ForwardMode::Tcp => {
                let forwarder = Arc::new(
                    TcpForwarder::bind(
                        mapping.listen_port,
                        pool,
                        selector,
                        affinity,
                        mapping.proxy,
                        Arc::clone(&counters),
                    )
                    .await?,
                );
                spawn_listener(mapping.listen_port, async move { forwarder.run().await });
            }
            ForwardMode::Http | ForwardMode::Https => {
                let tls = if mapping.mode == ForwardMode::Https {
                    if tls_config.is_none() {
                        tls_config = Some(load_tls_material(&args)?);
                    }
                    tls_config.clone()
                } else {
                    None
                };
                let forwarder = Arc::new(
                    HttpForwarder::bind(
                        mapping.listen_port,
                        mapping.backend_port,
                        pool,
                        selector,
                        affinity,
                        mapping.proxy,
                        Arc::clone(&counters),
                        tls,
                    )
                    .await?,
                );
                spawn_listener(mapping.listen_port, async move { forwarder.run().await });
            }
        }
    }

    info!("Running...");
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    Ok(())
}

/// Load the configured certificate pair, generating a self-signed
/// fallback in the working directory when either path is missing.
fn load_tls_material(args: &Args) -> anyhow::Result<Arc<ServerConfig>> {
    let (cert, key) = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => (cert.clone(), key.clone()),
        _ => generate_self_signed(Path::new("."))?,
    };
    Ok(load_server_config(&cert, &key)?)
}

/// Run a listener to completion; an accept-loop failure is fatal.
fn spawn_listener<E, F>(port: u16, task: F)
where
    E: std::error::Error,
    F: std::future::Future<Output = Result<(), E>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(port, error = %e, "Listener failed");
            std::process::exit(1);
        }
    });
}
