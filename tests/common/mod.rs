//! Loopback backends shared by the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relaylb::backend::{Backend, BackendRegistry, Strategy};
use relaylb::metrics::MetricsCollector;
use relaylb::proxy::{ProxyEngine, ProxyEngineConfig};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Request headers echoed back as `echo-<name>`.
const ECHOED_HEADERS: [&str; 4] = ["host", "x-forwarded-for", "x-forwarded-host", "x-request-id"];

/// A live HTTP backend on a loopback port.
pub struct TestBackend {
    pub url: String,
    /// Proxied requests served, health probes excluded.
    pub hits: Arc<AtomicUsize>,
    /// Controls whether `/health` answers 200 or 503.
    pub healthy: Arc<AtomicBool>,
}

impl TestBackend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

/// Spawn a backend that tags responses with `x-backend: <name>`, echoes the
/// request body, and echoes selected request headers.
pub async fn spawn_backend(name: &'static str) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(true));

    let task_hits = Arc::clone(&hits);
    let task_healthy = Arc::clone(&healthy);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hits = Arc::clone(&task_hits);
            let healthy = Arc::clone(&task_healthy);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    let healthy = Arc::clone(&healthy);
                    async move { Ok::<_, Infallible>(respond(name, req, &hits, &healthy).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestBackend {
        url: format!("http://{}", addr),
        hits,
        healthy,
    }
}

async fn respond(
    name: &'static str,
    req: Request<Incoming>,
    hits: &AtomicUsize,
    healthy: &AtomicBool,
) -> Response<Full<Bytes>> {
    if req.uri().path() == "/health" {
        let status = if healthy.load(Ordering::SeqCst) {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        return Response::builder()
            .status(status)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    hits.fetch_add(1, Ordering::SeqCst);

    let mut builder = Response::builder()
        .header("x-backend", name)
        .header("echo-path", req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
    for header in ECHOED_HEADERS {
        if let Some(value) = req.headers().get(header) {
            builder = builder.header(format!("echo-{}", header), value.clone());
        }
    }

    let body = req.into_body().collect().await.unwrap().to_bytes();
    builder.body(Full::new(body)).unwrap()
}

/// Spawn a backend that answers every request with `status`.
pub async fn spawn_status_backend(status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hits = Arc::clone(&task_hits);
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from("backend error")))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (format!("http://{}", addr), hits)
}

/// A backend that answers with headers and the first half of its body, then
/// holds the rest back until released.
pub struct StreamingBackend {
    pub url: String,
    /// Each `notify_one` lets one waiting response finish with `part2`.
    pub release: Arc<Notify>,
}

/// Spawn a backend whose responses are `part1` then, once released, `part2`.
pub async fn spawn_streaming_backend() -> StreamingBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let release = Arc::new(Notify::new());

    let task_release = Arc::clone(&release);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let release = Arc::clone(&task_release);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }

                let head = b"HTTP/1.1 200 OK\r\n\
                    content-length: 10\r\n\
                    x-backend: streaming\r\n\r\n\
                    part1";
                let _ = stream.write_all(head).await;
                let _ = stream.flush().await;

                release.notified().await;
                let _ = stream.write_all(b"part2").await;
                let _ = stream.flush().await;
            });
        }
    });

    StreamingBackend {
        url: format!("http://{}", addr),
        release,
    }
}

/// Spawn a listener that accepts and immediately drops every connection.
pub async fn spawn_closing_backend() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let task_accepts = Arc::clone(&accepts);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            task_accepts.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    (format!("http://{}", addr), accepts)
}

/// Spawn a listener that accepts connections and never answers.
pub async fn spawn_stalled_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    format!("http://{}", addr)
}

/// An address nothing listens on.
pub async fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Build a registry over `urls`, in order, all healthy.
pub fn registry(urls: &[&str]) -> Arc<BackendRegistry> {
    Arc::new(
        urls.iter()
            .map(|url| Arc::new(Backend::new(*url).unwrap()))
            .collect(),
    )
}

/// Build an engine with the given attempt budget and a short attempt deadline.
pub fn engine(
    registry: &Arc<BackendRegistry>,
    strategy: Strategy,
    max_retries: usize,
) -> ProxyEngine {
    engine_with_timeout(registry, strategy, max_retries, Duration::from_secs(5))
}

pub fn engine_with_timeout(
    registry: &Arc<BackendRegistry>,
    strategy: Strategy,
    max_retries: usize,
    attempt_timeout: Duration,
) -> ProxyEngine {
    let config = ProxyEngineConfig {
        max_retries,
        attempt_timeout,
        ..ProxyEngineConfig::default()
    };
    ProxyEngine::new(Arc::clone(registry), strategy, config, MetricsCollector::new())
}

/// Addresses currently marked unhealthy.
pub fn unhealthy(registry: &BackendRegistry) -> Vec<String> {
    registry
        .all_backends()
        .iter()
        .filter(|b| !b.is_healthy())
        .map(|b| b.address().to_string())
        .collect()
}
