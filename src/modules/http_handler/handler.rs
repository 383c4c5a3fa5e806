//! HTTP/HTTPS reverse proxy handler.
//!
//! Listener setup mirrors the TCP forwarder (optional PROXY ingest,
//! then optional TLS termination); each request is reverse-proxied to a
//! backend chosen by layered affinity: source-IP affinity first, the
//! `proxy-affinity` cookie second, the configured algorithm last.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ProxyProtocolConfig;
use crate::modules::load_balancer::{
    AffinityMap, Backend, BackendPool, ConnectionGuard, Selector,
};
use crate::modules::proxy_protocol::read_proxy_header;
use crate::modules::stats::{GlobalCounters, OpenGuard};

use super::error::{HttpError, HttpResult};

/// Cookie carrying the sticky backend choice.
pub const AFFINITY_COOKIE: &str = "proxy-affinity";

/// Response body type: proxied upstream bodies or canned error bodies.
type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// One L7 reverse-proxy listener for a mapping.
pub struct HttpForwarder {
    pub(crate) listener: TcpListener,
    pub(crate) listen_port: u16,
    pub(crate) backend_port: u16,
    pub(crate) pool: Arc<BackendPool>,
    pub(crate) selector: Arc<dyn Selector>,
    pub(crate) affinity: Option<Arc<AffinityMap>>,
    pub(crate) proxy: ProxyProtocolConfig,
    pub(crate) counters: Arc<GlobalCounters>,
    tls: Option<TlsAcceptor>,
    client: Client<HttpConnector, Incoming>,
}

impl HttpForwarder {
    /// Bind the listen socket for an HTTP or HTTPS mapping.
    ///
    /// A `tls_config` turns the listener into an HTTPS terminator;
    /// backends are reached over plain HTTP either way.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::BindError`] if binding fails; fatal at
    /// startup.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        listen_port: u16,
        backend_port: u16,
        pool: Arc<BackendPool>,
        selector: Arc<dyn Selector>,
        affinity: Option<Arc<AffinityMap>>,
        proxy: ProxyProtocolConfig,
        counters: Arc<GlobalCounters>,
        tls_config: Option<Arc<ServerConfig>>,
    ) -> HttpResult<Self> {
        let address = SocketAddr::from(([0, 0, 0, 0], listen_port));
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| HttpError::BindError { address, source: e })?;
        let listen_port = listener
            .local_addr()
            .map_err(|e| HttpError::BindError { address, source: e })?
            .port();

        // The upstream transport never verifies backend certificates;
        // backends are plain HTTP in this design.
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            listener,
            listen_port,
            backend_port,
            pool,
            selector,
            affinity,
            proxy,
            counters,
            tls: tls_config.map(TlsAcceptor::from),
            client,
        })
    }

    /// Get the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails fatally.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::AcceptError`] on an unrecoverable accept
    /// failure.
    pub async fn run(self: Arc<Self>) -> HttpResult<()> {
        info!(
            port = self.listen_port,
            host = self.pool.host(),
            backend_port = self.backend_port,
            algorithm = self.selector.name(),
            tls = self.tls.is_some(),
            "Forwarding"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let forwarder = Arc::clone(&self);
                    tokio::spawn(async move {
                        forwarder.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) if is_fatal_accept_error(&e) => {
                    return Err(HttpError::AcceptError(e));
                }
                Err(e) => {
                    warn!(port = self.listen_port, error = %e, "Transient accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Run PROXY ingest and the TLS handshake, then serve requests.
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) {
        let mut client_addr = peer_addr;
        if self.proxy.server_enabled {
            match read_proxy_header(&mut stream).await {
                Ok(Some(header)) => {
                    debug!(port = self.listen_port, from = %peer_addr, source = %header.source, "PROXY header accepted");
                    client_addr = header.source;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(port = self.listen_port, from = %peer_addr, error = %e, "PROXY header read failed");
                    return;
                }
            }
        }

        match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve(tls_stream, client_addr).await,
                Err(e) => {
                    warn!(port = self.listen_port, from = %client_addr, error = %e, "TLS handshake failed");
                }
            },
            None => self.serve(stream, client_addr).await,
        }
    }

    /// Serve HTTP/1.1 requests on an established stream.
    async fn serve<S>(self: Arc<Self>, stream: S, client_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let forwarder = Arc::clone(&self);
        let service = service_fn(move |req| {
            let forwarder = Arc::clone(&forwarder);
            async move {
                Ok::<_, std::convert::Infallible>(forwarder.handle_request(client_addr, req).await)
            }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!(port = self.listen_port, from = %client_addr, error = %e, "Connection ended with error");
        }
    }

    /// Reverse-proxy one request.
    async fn handle_request(
        &self,
        client_addr: SocketAddr,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let source_ip = Some(client_addr.ip());
        let mut backend: Option<Arc<Backend>> = None;
        let mut new_session = false;

        // Priority 1: source-IP affinity.
        if let (Some(affinity), Some(src)) = (&self.affinity, source_ip) {
            if let Some(bound_ip) = affinity.get(src) {
                if let Some(b) = self.pool.get(bound_ip) {
                    info!(source_ip = %src, backend_ip = %bound_ip, "IP affinity hit");
                    backend = Some(b);
                }
            }
        }

        // Priority 2: cookie affinity.
        if backend.is_none() {
            if let Some(cookie_ip) = affinity_cookie(req.headers()) {
                if let Some(b) = self.pool.get(cookie_ip) {
                    info!(from = %client_addr, backend_ip = %cookie_ip, "Cookie affinity hit");
                    backend = Some(b);
                }
            }
        }

        // Priority 3: the configured algorithm, which records affinity.
        let backend = match backend {
            Some(backend) => backend,
            None => {
                new_session = true;
                match self
                    .selector
                    .select(&self.pool, source_ip, self.affinity.as_deref())
                {
                    Ok(backend) => backend,
                    Err(e) => {
                        error!(host = self.pool.host(), error = %e, "Backend selection failed");
                        return service_unavailable();
                    }
                }
            }
        };

        let target_addr = SocketAddr::new(backend.ip(), self.backend_port);
        let cookie = format!("{AFFINITY_COOKIE}={}; Path=/", backend.ip());

        let open = OpenGuard::open(&self.counters);
        let conn = ConnectionGuard::connect(&self.pool, &backend, self.affinity.as_ref(), source_ip);

        info!(
            port = self.listen_port,
            from = %client_addr,
            to = %target_addr,
            backend = %backend.ip(),
            algorithm = self.selector.name(),
            new_session,
            count = self.counters.ops(),
            opened = self.counters.opened(),
            "Forwarding start"
        );

        // Backends always speak plain HTTP; TLS ends at the listener.
        let path = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let Ok(uri) = format!("http://{target_addr}{path}").parse::<Uri>() else {
            return service_unavailable();
        };

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        // Hop-by-hop; the incoming Host header rides along unchanged.
        parts.headers.remove(CONNECTION);
        let upstream_req = Request::from_parts(parts, body);

        match self.client.request(upstream_req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                // The guards ride on the response body so the backend
                // stays accounted for until the client drains it.
                let body = body
                    .map_frame(move |frame| {
                        let _ = (&open, &conn);
                        frame
                    })
                    .boxed();
                let mut response = Response::from_parts(parts, body);
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                info!(
                    port = self.listen_port,
                    from = %client_addr,
                    to = %target_addr,
                    backend = %backend.ip(),
                    status = response.status().as_u16(),
                    "Forwarding close"
                );
                response
            }
            Err(e) => {
                error!(
                    port = self.listen_port,
                    from = %client_addr,
                    to = %target_addr,
                    error = %e,
                    "Upstream request failed"
                );
                service_unavailable()
            }
        }
    }
}

/// Extract the `proxy-affinity` cookie as an IP, if present and valid.
fn affinity_cookie(headers: &hyper::HeaderMap) -> Option<IpAddr> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(AFFINITY_COOKIE) {
                if let Some(value) = parts.next() {
                    if let Ok(ip) = value.trim().parse() {
                        return Some(ip);
                    }
                }
            }
        }
    }
    None
}

/// Canned 503 for selection and upstream failures.
fn service_unavailable() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("content-type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(b"Service unavailable\n"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response")
}

/// Check if an accept error is fatal (unrecoverable).
fn is_fatal_accept_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::NotFound
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderMap;

    #[test]
    fn test_affinity_cookie_parses_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("session=abc; proxy-affinity=10.0.0.2; theme=dark"),
        );
        assert_eq!(
            affinity_cookie(&headers),
            Some("10.0.0.2".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_affinity_cookie_rejects_non_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("proxy-affinity=not-an-ip"));
        assert_eq!(affinity_cookie(&headers), None);
    }

    #[test]
    fn test_affinity_cookie_absent() {
        let headers = HeaderMap::new();
        assert_eq!(affinity_cookie(&headers), None);
    }

    #[test]
    fn test_affinity_cookie_across_multiple_headers() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("session=abc"));
        headers.append(COOKIE, HeaderValue::from_static("proxy-affinity=10.0.0.9"));
        assert_eq!(
            affinity_cookie(&headers),
            Some("10.0.0.9".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_service_unavailable_shape() {
        let response = service_unavailable();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
