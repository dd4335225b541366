//! Proxy request handler.
//!
//! Routes CONNECT requests to the tunnel path and everything else to the
//! HTTP-forward path. Both paths authenticate, select an outbound IP, reserve
//! a connection slot, record the selection, and guarantee the slot is
//! released on every exit path.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{error, info, trace};

use crate::balancer::{CircuitBreaker, LruBalancer};
use crate::error::{EgretError, Result};
use crate::limiter::Limiter;
use crate::metrics::{self, StatsCollector};
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::request_id;
use crate::proxy::transport::{parse_authority, Dialer, TransportPool};
use crate::proxy::tunnel;

/// Response body type unifying streamed upstream bodies and buffered errors.
pub type BoxedBody = BoxBody<Bytes, hyper::Error>;

/// Hop-by-hop headers are scoped to one transport hop and must not be
/// forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Configuration for the request handler
#[derive(Clone)]
pub struct RequestHandlerConfig {
    /// Timeout for upstream dials
    pub timeout: Duration,
    /// Idle timeout for CONNECT tunnels
    pub idle_timeout: Duration,
    /// TCP keep-alive interval for tunnel upstreams
    pub tcp_keepalive: Duration,
}

impl Default for RequestHandlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            tcp_keepalive: Duration::from_secs(30),
        }
    }
}

/// Owned release handle for an acquired connection slot.
///
/// Dropping the guard releases the limiter slot and the per-IP gauges, so the
/// release runs exactly once on every termination path.
pub struct ConnectionGuard {
    ip: String,
    limiter: Arc<Limiter>,
    stats: Arc<StatsCollector>,
}

impl ConnectionGuard {
    pub fn ip(&self) -> &str {
        &self.ip
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limiter.release(&self.ip);
        self.stats.dec_active_connections();
        self.stats.dec_connections_for_ip(&self.ip);
    }
}

/// Proxy request handler
pub struct RequestHandler {
    balancer: Arc<LruBalancer>,
    limiter: Arc<Limiter>,
    breaker: Option<Arc<CircuitBreaker>>,
    transports: Arc<TransportPool>,
    stats: Arc<StatsCollector>,
    auth: ProxyAuth,
    config: RequestHandlerConfig,
}

impl RequestHandler {
    pub fn new(
        balancer: Arc<LruBalancer>,
        limiter: Arc<Limiter>,
        breaker: Option<Arc<CircuitBreaker>>,
        transports: Arc<TransportPool>,
        stats: Arc<StatsCollector>,
        auth: ProxyAuth,
        config: RequestHandlerConfig,
    ) -> Self {
        Self {
            balancer,
            limiter,
            breaker,
            transports,
            stats,
            auth,
            config,
        }
    }

    /// Handle an incoming proxy request
    pub async fn handle(&self, req: Request<Incoming>, client_ip: String) -> Response<BoxedBody> {
        let start = Instant::now();
        let request_id = request_id::generate();

        trace!(
            %request_id,
            method = %req.method(),
            uri = %req.uri(),
            remote = %client_ip,
            "request received"
        );

        if self.auth.validate(&req, &client_ip).is_err() {
            metrics::AUTH_FAILURES.inc();
            return challenge_response();
        }

        if req.method() == Method::CONNECT {
            self.handle_connect(req, request_id, start).await
        } else {
            self.handle_http(req, client_ip, request_id, start).await
        }
    }

    /// CONNECT path: dial the target from the selected IP, then hand the
    /// client a raw byte tunnel.
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        request_id: String,
        start: Instant,
    ) -> Response<BoxedBody> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let (target_host, target_port) = match parse_authority(&authority) {
            Ok(target) => target,
            Err(e) => {
                trace!(%request_id, %authority, error = %e, "invalid CONNECT target");
                return error_response(StatusCode::BAD_REQUEST, "Invalid CONNECT target");
            }
        };

        let guard = match self.acquire_connection(&authority, &request_id) {
            Ok(guard) => guard,
            Err(e) => return self.rejection_response(e, &request_id, &authority),
        };

        metrics::TUNNEL_CONNECTIONS.inc();

        let ip_addr: IpAddr = match guard.ip().parse() {
            Ok(addr) => addr,
            Err(_) => {
                error!(%request_id, ip = guard.ip(), "selected IP does not parse");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
            }
        };

        let dialer = Dialer::new(ip_addr, self.config.timeout, self.config.tcp_keepalive);

        trace!(%request_id, host = %authority, ip = guard.ip(), "dialing upstream");
        let upstream = match dialer.dial(&target_host, target_port).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure(guard.ip());
                }
                error!(%request_id, host = %authority, ip = guard.ip(), error = %e, "upstream dial failed");
                metrics::REQUESTS_TOTAL
                    .with_label_values(&["CONNECT", "502"])
                    .inc();
                return error_response(StatusCode::BAD_GATEWAY, "Failed to connect to target");
            }
        };
        if let Some(breaker) = &self.breaker {
            breaker.record_success(guard.ip());
        }

        let stats = self.stats.clone();
        let idle_timeout = self.config.idle_timeout;
        let ip = guard.ip().to_string();
        let host = authority.clone();

        // The tunnel runs after hyper has written the 200 response and handed
        // over the client stream. The guard moves into the task so the slot
        // stays held until both halves finish.
        tokio::spawn(async move {
            let _guard = guard;
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client_io = TokioIo::new(upgraded);
                    let (bytes_in, bytes_out) = tunnel::run(client_io, upstream, idle_timeout).await;

                    stats.inc_total_requests();
                    stats.add_bytes_received(bytes_in as i64);
                    stats.add_bytes_sent(bytes_out as i64);

                    let duration = start.elapsed();
                    metrics::REQUESTS_TOTAL
                        .with_label_values(&["CONNECT", "200"])
                        .inc();
                    metrics::REQUEST_DURATION
                        .with_label_values(&["CONNECT"])
                        .observe(duration.as_secs_f64());

                    info!(
                        %request_id,
                        host = %host,
                        ip = %ip,
                        bytes_in,
                        bytes_out,
                        duration_ms = duration.as_millis() as u64,
                        "tunnel complete"
                    );
                }
                Err(e) => {
                    error!(%request_id, host = %host, error = %e, "client connection upgrade failed");
                    metrics::REQUESTS_TOTAL
                        .with_label_values(&["CONNECT", "500"])
                        .inc();
                }
            }
        });

        connect_established_response()
    }

    /// Forward path: send the request upstream via the transport bound to the
    /// selected IP and stream the response back.
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        client_ip: String,
        request_id: String,
        start: Instant,
    ) -> Response<BoxedBody> {
        let method = req.method().as_str().to_string();

        let host = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .unwrap_or_default();

        if host.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "Missing host");
        }

        let guard = match self.acquire_connection(&host, &request_id) {
            Ok(guard) => guard,
            Err(e) => return self.rejection_response(e, &request_id, &host),
        };

        let client = match self.transports.get(guard.ip()) {
            Ok(client) => client,
            Err(e) => {
                error!(%request_id, ip = guard.ip(), error = %e, "transport unavailable");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
            }
        };

        let out_req = match build_outgoing_request(req, &client_ip) {
            Ok(out_req) => out_req,
            Err(e) => {
                trace!(%request_id, error = %e, "rejecting malformed request");
                return error_response(StatusCode::BAD_REQUEST, "Invalid request");
            }
        };

        if let Some(len) = out_req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
        {
            if len > 0 {
                self.stats.add_bytes_received(len);
            }
        }

        trace!(%request_id, host = %host, ip = guard.ip(), method = %method, "forwarding upstream");
        let mut response = match client.request(out_req).await {
            Ok(response) => response,
            Err(e) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure(guard.ip());
                }
                error!(%request_id, host = %host, ip = guard.ip(), error = %e, "upstream request failed");
                metrics::REQUESTS_TOTAL
                    .with_label_values(&[&method, "502"])
                    .inc();
                return error_response(StatusCode::BAD_GATEWAY, "Failed to connect to upstream");
            }
        };
        if let Some(breaker) = &self.breaker {
            breaker.record_success(guard.ip());
        }

        remove_hop_by_hop_headers(response.headers_mut());

        let status = response.status();
        let duration = start.elapsed();

        self.stats.inc_total_requests();
        metrics::REQUESTS_TOTAL
            .with_label_values(&[&method, &status.as_u16().to_string()])
            .inc();
        metrics::REQUEST_DURATION
            .with_label_values(&[&method])
            .observe(duration.as_secs_f64());

        info!(
            %request_id,
            method = %method,
            host = %host,
            ip = guard.ip(),
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "request forwarded"
        );

        // Stream the body through unbuffered. The guard rides inside the
        // frame mapper, so the slot is released only after the last byte is
        // relayed or the client disconnects and the body is dropped.
        let stats = self.stats.clone();
        response.map(move |body| {
            let guard = guard;
            body.map_frame(move |frame| {
                let _hold = &guard;
                if let Some(data) = frame.data_ref() {
                    stats.add_bytes_sent(data.len() as i64);
                }
                frame
            })
            .boxed()
        })
    }

    /// Select an IP, reserve a slot on it, and record the selection.
    fn acquire_connection(&self, host: &str, request_id: &str) -> Result<ConnectionGuard> {
        let ip = self.balancer.select(host)?;
        trace!(%request_id, host, ip = %ip, "IP selected");

        self.limiter.acquire(&ip)?;
        trace!(%request_id, ip = %ip, "connection slot acquired");

        self.stats.inc_active_connections();
        self.stats.inc_connections_for_ip(&ip);

        self.balancer.record(host, &ip);
        self.stats.inc_selections_for_ip(&ip, host);

        Ok(ConnectionGuard {
            ip,
            limiter: self.limiter.clone(),
            stats: self.stats.clone(),
        })
    }

    /// Map selection/limit failures onto 503 responses and rejection metrics.
    fn rejection_response(
        &self,
        err: EgretError,
        request_id: &str,
        host: &str,
    ) -> Response<BoxedBody> {
        match err {
            EgretError::NoAvailableIps => {
                // Health and circuit filters degrade to the full set, so an
                // empty candidate set usually means every IP is at its cap;
                // report that as a limit rejection.
                if self
                    .limiter
                    .filter_available(self.balancer.ips())
                    .is_empty()
                {
                    trace!(%request_id, host, "all outbound IPs at connection limit");
                    metrics::LIMIT_REJECTIONS
                        .with_label_values(&["per_ip"])
                        .inc();
                    return error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Connection limit reached",
                    );
                }
                trace!(%request_id, host, "no available outbound IPs");
                metrics::LIMIT_REJECTIONS.with_label_values(&["total"]).inc();
                error_response(StatusCode::SERVICE_UNAVAILABLE, "No available outbound IPs")
            }
            EgretError::IpLimitReached => {
                trace!(%request_id, host, "per-IP connection limit reached");
                metrics::LIMIT_REJECTIONS
                    .with_label_values(&["per_ip"])
                    .inc();
                error_response(StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached")
            }
            EgretError::TotalLimitReached => {
                trace!(%request_id, host, "total connection limit reached");
                metrics::LIMIT_REJECTIONS.with_label_values(&["total"]).inc();
                error_response(StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached")
            }
            other => {
                error!(%request_id, host, error = %other, "acquire failed");
                error_response(other.status_code(), "Internal error")
            }
        }
    }
}

/// Build the outgoing request: absolute-form URI, hop-by-hop headers
/// stripped, X-Forwarded-For appended.
fn build_outgoing_request<B>(req: Request<B>, client_ip: &str) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();

    // Origin-form requests are upgraded to absolute form using the Host
    // header, as a classical forward proxy expects.
    if parts.uri.scheme().is_none() {
        let authority = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| EgretError::InvalidRequest("missing Host header".to_string()))?
            .to_string();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        parts.uri = Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| EgretError::InvalidRequest(format!("invalid request URI: {}", e)))?;
    }

    remove_hop_by_hop_headers(&mut parts.headers);
    append_forwarded_for(&mut parts.headers, client_ip);

    Ok(Request::from_parts(parts, body))
}

/// Remove the standard hop-by-hop headers plus any names listed in the
/// Connection header value.
fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut listed: Vec<String> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(s) = value.to_str() {
            for name in s.split(',') {
                let name = name.trim().to_ascii_lowercase();
                if !name.is_empty() {
                    listed.push(name);
                }
            }
        }
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

/// Append the client IP to X-Forwarded-For, preserving any existing chain.
fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    if client_ip.is_empty() {
        return;
    }

    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Extract the client IP from a remote address string.
///
/// Handles `[v6]:port` (including zone identifiers), `host:port`, and
/// bare-host forms.
pub fn extract_client_ip(remote: &str) -> &str {
    if remote.starts_with('[') {
        if let Some(idx) = remote.find("]:") {
            return &remote[1..idx];
        }
        return remote;
    }
    match remote.rsplit_once(':') {
        Some((host, _port)) => host,
        None => remote,
    }
}

fn full(text: &'static str) -> BoxedBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> BoxedBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn error_response(status: StatusCode, message: &'static str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full(message))
        .unwrap()
}

/// CONNECT success reply. hyper writes the extension's bytes as the
/// status-line reason phrase, so the wire carries the literal
/// `HTTP/1.1 200 Connection Established`.
fn connect_established_response() -> Response<BoxedBody> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(empty())
        .unwrap();
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// 407 Proxy Authentication Required with the Basic challenge.
fn challenge_response() -> Response<BoxedBody> {
    Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header(PROXY_AUTHENTICATE, "Basic realm=\"Proxy\"")
        .body(full("Proxy Authentication Required"))
        .unwrap()
}
