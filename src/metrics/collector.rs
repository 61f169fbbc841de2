//! Metrics collector using prometheus-client.
//!
//! Provides metrics for client requests, upstream attempts, and backend health.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for client request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub status: String,
}

/// Labels for backend health metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for per-backend outcome counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub backend: String,
    pub result: Outcome,
}

/// Result of an upstream attempt or health probe.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Client requests by final status.
    requests_total: Family<RequestLabels, Counter>,
    /// End-to-end request duration (in seconds).
    request_duration_seconds: Histogram,
    /// Forwarding attempts by backend and result.
    upstream_attempts_total: Family<OutcomeLabels, Counter>,
    /// Backend health gauge (1 = healthy, 0 = unhealthy).
    backend_health: Family<BackendLabels, Gauge>,
    /// Health probe results.
    health_checks_total: Family<OutcomeLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        // Buckets: 1ms up to roughly 15s
        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.5, 12));
        let upstream_attempts_total = Family::<OutcomeLabels, Counter>::default();
        let backend_health = Family::<BackendLabels, Gauge>::default();
        let health_checks_total = Family::<OutcomeLabels, Counter>::default();

        registry.register(
            "relaylb_requests",
            "Total number of client requests handled",
            requests_total.clone(),
        );
        registry.register(
            "relaylb_request_duration_seconds",
            "Client request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "relaylb_upstream_attempts",
            "Total number of forwarding attempts per backend",
            upstream_attempts_total.clone(),
        );
        registry.register(
            "relaylb_backend_health",
            "Backend health status (1=healthy, 0=unhealthy)",
            backend_health.clone(),
        );
        registry.register(
            "relaylb_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                upstream_attempts_total,
                backend_health,
                health_checks_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a completed client request.
    pub fn record_request(&self, status: u16, duration: Duration) {
        let labels = RequestLabels {
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
        self.inner
            .request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record one forwarding attempt against a backend.
    pub fn record_attempt(&self, backend: &str, success: bool) {
        let labels = OutcomeLabels {
            backend: backend.to_string(),
            result: success.into(),
        };
        self.inner.upstream_attempts_total.get_or_create(&labels).inc();
    }

    /// Update backend health status.
    pub fn set_backend_health(&self, backend: &str, healthy: bool) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .backend_health
            .get_or_create(&labels)
            .set(if healthy { 1 } else { 0 });
    }

    /// Record a health check result.
    pub fn record_health_check(&self, backend: &str, success: bool) {
        let labels = OutcomeLabels {
            backend: backend.to_string(),
            result: success.into(),
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
