//! Per-request retry and failover dispatch.
//!
//! Each inbound request is buffered once, then forwarded to backends chosen
//! by the configured [`Strategy`]. A backend that fails to produce a
//! response is marked unhealthy and excluded for the rest of the request,
//! and the next candidate is tried until the attempt budget runs out.

use crate::backend::{Backend, BackendRegistry, Strategy};
use crate::config::ProxyConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::body::RelayBody;
use crate::proxy::{Transport, TransportError};
use crate::util::RequestId;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderName};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout_at;
use tracing::{debug, info, instrument, warn};

/// Response body type produced by the engine.
pub type ProxyBody = BoxBody<Bytes, TransportError>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Headers that apply to a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Engine settings.
#[derive(Debug, Clone)]
pub struct ProxyEngineConfig {
    /// Maximum forwarding attempts per request.
    pub max_retries: usize,
    /// Deadline for a single forwarding attempt.
    pub attempt_timeout: Duration,
    /// Trusted header carrying the original client IP.
    pub client_ip_header: HeaderName,
}

impl Default for ProxyEngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
            client_ip_header: HeaderName::from_static("x-real-ip"),
        }
    }
}

impl TryFrom<&ProxyConfig> for ProxyEngineConfig {
    type Error = InvalidHeaderName;

    fn try_from(config: &ProxyConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            max_retries: config.max_retries,
            attempt_timeout: config.attempt_timeout,
            client_ip_header: HeaderName::from_bytes(config.client_ip_header.as_bytes())?,
        })
    }
}

/// Forwards requests to backends with retry and failover.
pub struct ProxyEngine {
    registry: Arc<BackendRegistry>,
    strategy: Strategy,
    config: ProxyEngineConfig,
    metrics: MetricsCollector,
}

/// Forwarded-header values computed once per inbound request.
struct Forwarding {
    client_ip: String,
    forwarded_for: Option<HeaderValue>,
    forwarded_host: Option<HeaderValue>,
    request_id: RequestId,
}

impl ProxyEngine {
    /// Create a new proxy engine.
    pub fn new(
        registry: Arc<BackendRegistry>,
        strategy: Strategy,
        config: ProxyEngineConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            strategy,
            config,
            metrics,
        }
    }

    /// The registry this engine selects from.
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// The selection strategy in use.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Proxy one inbound request.
    ///
    /// Always produces a response: the first one any backend returns, or
    /// `503 Service Unavailable` once no eligible backend is left or the
    /// attempt budget is spent.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let start_time = Instant::now();
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(client = %remote_addr, error = %e, "failed to read request body");
                return self.finish(
                    error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
                    start_time,
                );
            }
        };

        let forwarding = self.forwarding_headers(&parts, remote_addr);
        let response = self.dispatch(&parts, body, &forwarding).await;

        info!(
            request_id = %forwarding.request_id,
            client = %forwarding.client_ip,
            method = %parts.method,
            uri = %parts.uri,
            status = response.status().as_u16(),
            duration_ms = start_time.elapsed().as_millis(),
            "request completed"
        );

        self.finish(response, start_time)
    }

    /// Run the retry loop for a buffered request.
    #[instrument(skip_all, fields(request_id = %forwarding.request_id))]
    async fn dispatch(
        &self,
        parts: &Parts,
        body: Bytes,
        forwarding: &Forwarding,
    ) -> Response<ProxyBody> {
        let mut attempted: HashSet<String> = HashSet::new();

        for attempt in 0..self.config.max_retries {
            let Some(backend) = self.next_backend_excluding(&attempted) else {
                warn!(attempts = attempt, "no available backends");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "no available backends");
            };

            attempted.insert(backend.address().to_string());

            debug!(
                backend = %backend,
                attempt = attempt + 1,
                max_attempts = self.config.max_retries,
                "attempting request"
            );

            match self.forward(&backend, parts, body.clone(), forwarding).await {
                Ok(response) => {
                    self.metrics.record_attempt(backend.address(), true);
                    return response;
                }
                Err(e) => {
                    self.metrics.record_attempt(backend.address(), false);
                    warn!(
                        backend = %backend,
                        attempt = attempt + 1,
                        error = %e,
                        "backend failed, marking unhealthy"
                    );
                    if self.registry.mark_health(backend.address(), false) == Some(true) {
                        self.metrics.set_backend_health(backend.address(), false);
                    }
                }
            }
        }

        warn!(attempts = self.config.max_retries, "all retry attempts exhausted");
        error_response(StatusCode::SERVICE_UNAVAILABLE, "all retry attempts exhausted")
    }

    /// Ask the strategy for a backend not yet attempted by this request.
    ///
    /// The strategy knows nothing about exclusions, so it is re-invoked up to
    /// once per registered backend.
    fn next_backend_excluding(&self, attempted: &HashSet<String>) -> Option<Arc<Backend>> {
        for _ in 0..self.registry.count() {
            let backend = self.strategy.select_next(&self.registry)?;
            if !attempted.contains(backend.address()) {
                return Some(backend);
            }
        }
        None
    }

    /// Make a single forwarding attempt.
    ///
    /// Any response counts as success, whatever its status. Transport errors
    /// and deadline expiry before the response headers are failures.
    ///
    /// The attempt stays counted against the backend, and bound by the same
    /// deadline, until the relayed body has been fully read or dropped.
    async fn forward(
        &self,
        backend: &Arc<Backend>,
        parts: &Parts,
        body: Bytes,
        forwarding: &Forwarding,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let connection = backend.track_connection();
        let deadline = tokio::time::Instant::now() + self.config.attempt_timeout;

        let req = build_upstream_request(backend.transport(), parts, body, forwarding)?;

        let response = timeout_at(deadline, backend.transport().send(req))
            .await
            .map_err(|_| TransportError::Timeout(self.config.attempt_timeout))??;

        let (mut response_parts, response_body) = response.into_parts();
        strip_hop_by_hop(&mut response_parts.headers);

        debug!(
            backend = %backend,
            status = response_parts.status.as_u16(),
            "backend responded"
        );

        let relayed = RelayBody::new(
            response_body.boxed(),
            connection,
            deadline,
            self.config.attempt_timeout,
        );

        Ok(Response::from_parts(response_parts, relayed.boxed()))
    }

    fn forwarding_headers(&self, parts: &Parts, remote_addr: SocketAddr) -> Forwarding {
        let client_ip = client_ip(&parts.headers, &self.config.client_ip_header, remote_addr);
        let forwarded_for =
            HeaderValue::from_str(&forwarded_for_chain(&parts.headers, &client_ip)).ok();

        let forwarded_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        Forwarding {
            client_ip,
            forwarded_for,
            forwarded_host,
            request_id: RequestId::from_headers(&parts.headers),
        }
    }

    fn finish(&self, response: Response<ProxyBody>, start_time: Instant) -> Response<ProxyBody> {
        self.metrics
            .record_request(response.status().as_u16(), start_time.elapsed());
        response
    }
}

/// Build the request sent to a backend for one attempt.
fn build_upstream_request(
    transport: &Transport,
    parts: &Parts,
    body: Bytes,
    forwarding: &Forwarding,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut req = Request::builder()
        .method(parts.method.clone())
        .uri(transport.target_uri(path_and_query)?)
        .body(Full::new(body))?;

    let headers = req.headers_mut();
    *headers = parts.headers.clone();
    strip_hop_by_hop(headers);

    if let Some(value) = &forwarding.forwarded_for {
        headers.insert(X_FORWARDED_FOR, value.clone());
    }
    if let Some(value) = &forwarding.forwarded_host {
        headers.insert(X_FORWARDED_HOST, value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(forwarding.request_id.as_str()) {
        headers.insert(X_REQUEST_ID, value);
    }

    Ok(req)
}

/// Derive the client IP: the trusted header if present, otherwise the
/// remote address without its port.
pub fn client_ip(
    headers: &HeaderMap,
    trusted_header: &HeaderName,
    remote_addr: SocketAddr,
) -> String {
    headers
        .get(trusted_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote_addr.ip().to_string())
}

/// Append `client_ip` to any existing forwarded-for chain.
pub fn forwarded_for_chain(headers: &HeaderMap, client_ip: &str) -> String {
    match headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip.to_string(),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Create a plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}: {}\n", status, message)))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
