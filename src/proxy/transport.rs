//! Outbound HTTP transport bound to a single backend.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::USER_AGENT;
use hyper::http::uri::{Authority, InvalidUri, Scheme};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

/// User agent sent with health probes.
const PROBE_USER_AGENT: &str = concat!("relaylb-health-check/", env!("CARGO_PKG_VERSION"));

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid backend address: {0}")]
    InvalidAddress(#[from] InvalidUri),

    #[error("unsupported scheme in backend address '{0}' (only http is supported)")]
    UnsupportedScheme(String),

    #[error("backend address '{0}' has no host")]
    MissingHost(String),

    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("backend response body failed: {0}")]
    Body(#[from] hyper::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

/// Pooled HTTP/1.1 client for one backend.
///
/// Created once per backend and reused for every forwarded request and
/// health probe.
#[derive(Clone)]
pub struct Transport {
    /// Backend authority (host and port).
    authority: Authority,
    /// Backend base path without trailing slash, prefixed to request paths.
    base_path: String,
    /// Connection-pooling client.
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Transport {
    /// Create a transport for the given base address, e.g. `http://10.0.0.1:8080`.
    pub fn new(address: &str) -> Result<Self, TransportError> {
        let base: Uri = address.parse()?;

        if base.scheme() != Some(&Scheme::HTTP) {
            return Err(TransportError::UnsupportedScheme(address.to_string()));
        }

        let authority = base
            .authority()
            .filter(|a| !a.host().is_empty())
            .cloned()
            .ok_or_else(|| TransportError::MissingHost(address.to_string()))?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            authority,
            base_path: base.path().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Build the upstream URI for a request path (and query).
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, TransportError> {
        let path_and_query = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };

        let uri = format!("http://{}{}{}", self.authority, self.base_path, path_and_query);
        Ok(uri.parse()?)
    }

    /// Send a request to the backend.
    ///
    /// The request URI must already point at this backend; see [`Transport::target_uri`].
    pub async fn send(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, TransportError> {
        Ok(self.client.request(req).await?)
    }

    /// Issue a GET to `path` and return the response status.
    ///
    /// The response body is discarded.
    pub async fn probe(
        &self,
        path: &str,
        probe_timeout: Duration,
    ) -> Result<StatusCode, TransportError> {
        let req = Request::get(self.target_uri(path)?)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .body(Full::new(Bytes::new()))?;

        let response = timeout(probe_timeout, self.send(req))
            .await
            .map_err(|_| TransportError::Timeout(probe_timeout))??;

        Ok(response.status())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("authority", &self.authority)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}
