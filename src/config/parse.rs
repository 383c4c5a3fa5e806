//! Mapping argument and option parsing.
//!
//! Mapping grammar: `[listen[-listen2]:]host:backend[-backend2][,option]*`
//! with options `http`, `https`, `affinity`, `lb=<name>`,
//! `proxy-server=v1|v2|1|2` and `proxy-client=v1|v2|1|2`.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::warn;

use super::error::{ConfigError, ConfigResult};
use super::types::{ForwardMode, PortMapping, ProxyProtocolConfig, ProxyVersion};

/// Deprecated global PROXY protocol flags, resolved before mappings parse.
///
/// `--server-proxy-protocol` / `--client-proxy-protocol` imply v1; a
/// per-mapping `proxy-server=` / `proxy-client=` option overrides them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyDefaults {
    /// Global server-side default, if the deprecated flag was set.
    pub server: Option<ProxyVersion>,
    /// Global client-side default, if the deprecated flag was set.
    pub client: Option<ProxyVersion>,
}

/// Expand a port expression into the list of ports it covers.
///
/// `"8080"` yields `[8080]`; `"8080-8083"` yields all four ports. An
/// empty bound or a descending range is an error.
pub fn parse_port_range(expr: &str) -> ConfigResult<Vec<u16>> {
    let Some((start, end)) = expr.split_once('-') else {
        let port = parse_port(expr)?;
        return Ok(vec![port]);
    };

    if start.is_empty() || end.is_empty() {
        return Err(ConfigError::InvalidPortRange(expr.to_string()));
    }

    let start = parse_port(start)?;
    let end = parse_port(end)?;
    if start > end {
        return Err(ConfigError::InvalidPortRange(expr.to_string()));
    }

    Ok((start..=end).collect())
}

fn parse_port(s: &str) -> ConfigResult<u16> {
    s.parse()
        .map_err(|e| ConfigError::InvalidPort(s.to_string(), e))
}

/// Parse a PROXY protocol option value.
///
/// Empty means disabled; `v1`/`1` and `v2`/`2` select a version.
/// Anything else (including uppercase) is rejected.
pub fn parse_proxy_version(value: &str) -> ConfigResult<Option<ProxyVersion>> {
    match value {
        "" => Ok(None),
        "v1" | "1" => Ok(Some(ProxyVersion::V1)),
        "v2" | "2" => Ok(Some(ProxyVersion::V2)),
        other => Err(ConfigError::InvalidProxyVersion(other.to_string())),
    }
}

/// Parse one mapping argument into its expanded per-port mappings.
pub fn parse_mapping(arg: &str, defaults: ProxyDefaults) -> ConfigResult<Vec<PortMapping>> {
    let mut parts = arg.split(',');
    let address = parts.next().unwrap_or_default();
    let options: Vec<&str> = parts.collect();

    let fields: Vec<&str> = address.split(':').collect();
    let (listen_expr, host, backend_expr) = match fields.as_slice() {
        [listen, host, backend] => (*listen, *host, *backend),
        // host:port shorthand listens on the backend port itself.
        [host, port] => (*port, *host, *port),
        _ => return Err(ConfigError::InvalidMapping(arg.to_string())),
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidMapping(arg.to_string()));
    }

    let listen_ports = parse_port_range(listen_expr)?;
    let backend_ports = parse_port_range(backend_expr)?;
    if listen_ports.len() != backend_ports.len() {
        return Err(ConfigError::RangeLengthMismatch {
            listen: listen_ports.len(),
            backend: backend_ports.len(),
        });
    }

    let mut mode = ForwardMode::Tcp;
    let mut algorithm = None;
    let mut affinity_enabled = false;
    let mut proxy = ProxyProtocolConfig::default();
    if let Some(version) = defaults.server {
        proxy.server_enabled = true;
        proxy.server_version = version;
    }
    if let Some(version) = defaults.client {
        proxy.client_enabled = true;
        proxy.client_version = version;
    }

    let mut http = false;
    let mut https = false;
    for option in options {
        let (name, value) = match option.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (option, None),
        };
        match (name, value) {
            ("http", None) => http = true,
            ("https", None) => https = true,
            ("affinity", None) => affinity_enabled = true,
            ("lb", Some(value)) => algorithm = Some(value.to_string()),
            ("proxy-server", value) => {
                match parse_proxy_version(value.unwrap_or_default())? {
                    Some(version) => {
                        proxy.server_enabled = true;
                        proxy.server_version = version;
                    }
                    None => proxy.server_enabled = false,
                }
            }
            ("proxy-client", value) => {
                match parse_proxy_version(value.unwrap_or_default())? {
                    Some(version) => {
                        proxy.client_enabled = true;
                        proxy.client_version = version;
                    }
                    None => proxy.client_enabled = false,
                }
            }
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        }
    }

    if http && https {
        return Err(ConfigError::ConflictingModes(arg.to_string()));
    }
    if http {
        mode = ForwardMode::Http;
    } else if https {
        mode = ForwardMode::Https;
    }

    Ok(listen_ports
        .into_iter()
        .zip(backend_ports)
        .map(|(listen_port, backend_port)| PortMapping {
            listen_port,
            host: host.to_string(),
            backend_port,
            mode,
            algorithm: algorithm.clone(),
            affinity_enabled,
            proxy,
        })
        .collect())
}

/// Parse the `--backend-weights` flag.
///
/// Grammar: `host:ip1=w1,ip2=w2;host2:ip3=w3,...`. Malformed entries are
/// skipped with a warning, matching lenient startup for a tuning knob.
pub fn parse_backend_weights(raw: &str) -> HashMap<String, HashMap<IpAddr, u32>> {
    let mut result: HashMap<String, HashMap<IpAddr, u32>> = HashMap::new();
    for entry in raw.split(';').filter(|e| !e.is_empty()) {
        let Some((host, weights_str)) = entry.split_once(':') else {
            warn!(entry, "Invalid backend weight entry");
            continue;
        };

        let mut weights = HashMap::new();
        for ip_weight in weights_str.split(',') {
            let Some((ip, weight)) = ip_weight.split_once('=') else {
                warn!(entry = ip_weight, "Invalid IP weight");
                continue;
            };
            let Ok(ip) = ip.parse::<IpAddr>() else {
                warn!(ip, "Invalid IP in backend weights");
                continue;
            };
            let Ok(weight) = weight.parse::<u32>() else {
                warn!(%ip, weight, "Invalid weight value");
                continue;
            };
            weights.insert(ip, weight);
        }

        if !weights.is_empty() {
            result.entry(host.to_string()).or_default().extend(weights);
        }
    }
    result
}
