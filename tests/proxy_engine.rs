//! Retry and failover behaviour of the proxy engine against live backends.

mod common;

use bytes::Bytes;
use common::*;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use relaylb::backend::Strategy;
use relaylb::backend::algorithms::{LeastConnections, RoundRobin};
use relaylb::proxy::TransportError;
use std::net::SocketAddr;
use std::time::Duration;

fn client_addr() -> SocketAddr {
    "192.0.2.10:40000".parse().unwrap()
}

fn get(path: &str) -> Request<Full<Bytes>> {
    Request::get(path)
        .header("host", "lb.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn body_text<B>(body: B) -> String
where
    B: hyper::body::Body,
    B::Error: std::fmt::Debug,
{
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn assert_failover_after_dead_backends(strategy: Strategy) {
    let dead1 = refused_address().await;
    let dead2 = refused_address().await;
    let good = spawn_backend("good").await;

    let registry = registry(&[&dead1, &dead2, &good.url]);
    let engine = engine(&registry, strategy, 3);

    let resp = engine.handle(get("/"), client_addr()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-backend"], "good");
    assert_eq!(good.hits(), 1);

    let mut down = unhealthy(&registry);
    down.sort();
    let mut expected = vec![dead1, dead2];
    expected.sort();
    assert_eq!(down, expected);
}

#[tokio::test]
async fn test_round_robin_fails_over_to_healthy_backend() {
    assert_failover_after_dead_backends(Strategy::RoundRobin(RoundRobin)).await;
}

#[tokio::test]
async fn test_least_connections_fails_over_to_healthy_backend() {
    assert_failover_after_dead_backends(Strategy::LeastConnections(LeastConnections)).await;
}

#[tokio::test]
async fn test_exhausted_attempts_return_503() {
    let (a, a_accepts) = spawn_closing_backend().await;
    let (b, b_accepts) = spawn_closing_backend().await;
    let (c, c_accepts) = spawn_closing_backend().await;

    let registry = registry(&[&a, &b, &c]);
    let engine = engine(&registry, Strategy::default(), 3);

    let resp = engine.handle(get("/"), client_addr()).await;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_text(resp.into_body()).await.contains("all retry attempts exhausted"));

    // Each backend tried exactly once
    assert_eq!(a_accepts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(b_accepts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(c_accepts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(registry.healthy_count(), 0);
}

#[tokio::test]
async fn test_budget_larger_than_pool_stops_when_pool_is_spent() {
    let dead1 = refused_address().await;
    let dead2 = refused_address().await;

    let registry = registry(&[&dead1, &dead2]);
    let engine = engine(&registry, Strategy::default(), 5);

    let resp = engine.handle(get("/"), client_addr()).await;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_text(resp.into_body()).await.contains("no available backends"));
    assert_eq!(registry.healthy_count(), 0);
}

#[tokio::test]
async fn test_attempt_budget_bounds_marking() {
    let dead1 = refused_address().await;
    let dead2 = refused_address().await;
    let dead3 = refused_address().await;
    let good = spawn_backend("good").await;

    let registry = registry(&[&dead1, &dead2, &dead3, &good.url]);
    let engine = engine(&registry, Strategy::default(), 2);

    let resp = engine.handle(get("/"), client_addr()).await;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(unhealthy(&registry), vec![dead1, dead2]);
    assert_eq!(good.hits(), 0);
}

#[tokio::test]
async fn test_attempt_deadline_triggers_failover() {
    let stalled = spawn_stalled_backend().await;
    let good = spawn_backend("good").await;

    let registry = registry(&[&stalled, &good.url]);
    let engine = engine_with_timeout(&registry, Strategy::default(), 2, Duration::from_millis(200));

    let resp = engine.handle(get("/"), client_addr()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-backend"], "good");
    assert_eq!(unhealthy(&registry), vec![stalled]);
}

#[tokio::test]
async fn test_error_status_is_relayed_without_failover() {
    let (failing, failing_hits) = spawn_status_backend(StatusCode::INTERNAL_SERVER_ERROR).await;
    let good = spawn_backend("good").await;

    let registry = registry(&[&failing, &good.url]);
    let engine = engine(&registry, Strategy::default(), 3);

    let resp = engine.handle(get("/"), client_addr()).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(resp.into_body()).await, "backend error");
    assert_eq!(failing_hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(good.hits(), 0);
    assert_eq!(registry.healthy_count(), 2);
}

#[tokio::test]
async fn test_forwarded_headers_added_once_across_retries() {
    let dead = refused_address().await;
    let good = spawn_backend("good").await;

    let registry = registry(&[&dead, &good.url]);
    let engine = engine(&registry, Strategy::default(), 2);

    let req = Request::get("/api/items?page=2")
        .header("host", "lb.example.com")
        .header("x-forwarded-for", "198.51.100.1")
        .header("x-request-id", "trace-42")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = engine.handle(req, client_addr()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["echo-path"], "/api/items?page=2");
    assert_eq!(resp.headers()["echo-host"], "lb.example.com");
    assert_eq!(resp.headers()["echo-x-forwarded-for"], "198.51.100.1, 192.0.2.10");
    assert_eq!(resp.headers()["echo-x-forwarded-host"], "lb.example.com");
    assert_eq!(resp.headers()["echo-x-request-id"], "trace-42");
}

#[tokio::test]
async fn test_trusted_client_ip_header() {
    let good = spawn_backend("good").await;
    let registry = registry(&[&good.url]);
    let engine = engine(&registry, Strategy::default(), 1);

    let req = Request::get("/")
        .header("x-real-ip", "203.0.113.5")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = engine.handle(req, client_addr()).await;

    assert_eq!(resp.headers()["echo-x-forwarded-for"], "203.0.113.5");
}

#[tokio::test]
async fn test_request_body_replayed_on_retry() {
    let (closing, _) = spawn_closing_backend().await;
    let good = spawn_backend("good").await;

    let registry = registry(&[&closing, &good.url]);
    let engine = engine(&registry, Strategy::default(), 2);

    let req = Request::post("/orders")
        .body(Full::new(Bytes::from("{\"qty\":3}")))
        .unwrap();
    let resp = engine.handle(req, client_addr()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp.into_body()).await, "{\"qty\":3}");
}

#[tokio::test]
async fn test_connection_counts_return_to_zero() {
    let dead = refused_address().await;
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;

    let registry = registry(&[&dead, &a.url, &b.url]);
    let engine = engine(&registry, Strategy::LeastConnections(LeastConnections), 3);

    for _ in 0..6 {
        let resp = engine.handle(get("/"), client_addr()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let _ = body_text(resp.into_body()).await;
    }

    assert_eq!(a.hits() + b.hits(), 6);
    for backend in registry.all_backends() {
        assert_eq!(backend.active_connections(), 0, "{}", backend);
    }
}

#[tokio::test]
async fn test_streaming_response_counted_until_body_drained() {
    let streaming = spawn_streaming_backend().await;
    let idle = spawn_backend("idle").await;

    let registry = registry(&[&streaming.url, &idle.url]);
    let engine = engine(&registry, Strategy::LeastConnections(LeastConnections), 3);
    let busy = registry.all_backends()[0].clone();

    let resp = engine.handle(get("/"), client_addr()).await;
    assert_eq!(resp.headers()["x-backend"], "streaming");

    let mut body = resp.into_body();
    let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
    assert!(!first.is_empty());
    assert_eq!(busy.active_connections(), 1);

    // The backend still streaming is not the least loaded one
    let next = engine.handle(get("/"), client_addr()).await;
    assert_eq!(next.headers()["x-backend"], "idle");
    let _ = body_text(next.into_body()).await;
    assert_eq!(busy.active_connections(), 1);

    streaming.release.notify_one();
    let rest = body_text(body).await;
    assert_eq!(format!("{}{}", String::from_utf8_lossy(&first), rest), "part1part2");
    assert_eq!(busy.active_connections(), 0);
}

#[tokio::test]
async fn test_dropping_response_mid_body_releases_backend() {
    let streaming = spawn_streaming_backend().await;

    let registry = registry(&[&streaming.url]);
    let engine = engine(&registry, Strategy::default(), 1);
    let backend = registry.all_backends()[0].clone();

    let resp = engine.handle(get("/"), client_addr()).await;
    let mut body = resp.into_body();
    let _ = body.frame().await.unwrap().unwrap();
    assert_eq!(backend.active_connections(), 1);

    drop(body);
    assert_eq!(backend.active_connections(), 0);
}

#[tokio::test]
async fn test_attempt_deadline_covers_response_body() {
    let streaming = spawn_streaming_backend().await;

    let registry = registry(&[&streaming.url]);
    let engine = engine_with_timeout(
        &registry,
        Strategy::default(),
        1,
        Duration::from_millis(300),
    );
    let backend = registry.all_backends()[0].clone();

    let resp = engine.handle(get("/"), client_addr()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // The rest of the body is never released
    let mut body = resp.into_body();
    let stalled = loop {
        match body.frame().await {
            Some(Ok(_)) => continue,
            other => break other,
        }
    };
    assert!(matches!(stalled, Some(Err(TransportError::Timeout(_)))));
    assert_eq!(backend.active_connections(), 0);
}

#[tokio::test]
async fn test_round_robin_rotates_across_requests() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;
    let c = spawn_backend("c").await;

    let registry = registry(&[&a.url, &b.url, &c.url]);
    let engine = engine(&registry, Strategy::default(), 3);

    let mut order = Vec::new();
    for _ in 0..6 {
        let resp = engine.handle(get("/"), client_addr()).await;
        order.push(resp.headers()["x-backend"].to_str().unwrap().to_string());
    }

    assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);
}
