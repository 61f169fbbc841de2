//! Active health monitor.
//!
//! Periodically probes every registered backend and updates its health flag.

use crate::backend::{Backend, BackendRegistry};
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// A health flag change observed during a check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    /// Backend address.
    pub address: String,
    /// New health flag.
    pub healthy: bool,
}

/// Background task that probes backends on a fixed interval.
pub struct HealthMonitor {
    /// Registry whose backends are probed.
    registry: Arc<BackendRegistry>,
    /// Time between check cycles.
    interval: Duration,
    /// Timeout for a single probe.
    timeout: Duration,
    /// Path requested on each backend.
    path: String,
    /// Metrics collector.
    metrics: MetricsCollector,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(
        registry: Arc<BackendRegistry>,
        config: &HealthCheckConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            interval: config.interval,
            timeout: config.timeout,
            path: config.path.clone(),
            metrics,
        }
    }

    /// Run until shutdown.
    ///
    /// The first cycle runs immediately, then one per interval. A cycle in
    /// progress finishes before shutdown is observed.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            path = %self.path,
            backends = self.registry.count(),
            "health monitor starting"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }

                _ = shutdown.recv() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every backend once, sequentially.
    ///
    /// Returns the health transitions caused by this cycle. Each transition
    /// is logged once; steady states are not logged.
    pub async fn check_all(&self) -> Vec<HealthTransition> {
        let mut transitions = Vec::new();

        for backend in self.registry.all_backends() {
            let healthy = self.probe(&backend).await;
            self.metrics.record_health_check(backend.address(), healthy);
            self.metrics.set_backend_health(backend.address(), healthy);

            let Some(was_healthy) = self.registry.mark_health(backend.address(), healthy) else {
                continue;
            };

            if was_healthy == healthy {
                continue;
            }

            if healthy {
                info!(backend = %backend, "backend is now healthy");
            } else {
                warn!(backend = %backend, "backend is now unhealthy");
            }

            transitions.push(HealthTransition {
                address: backend.address().to_string(),
                healthy,
            });
        }

        debug!(
            healthy = self.registry.healthy_count(),
            total = self.registry.count(),
            "health check cycle complete"
        );

        transitions
    }

    /// Probe a single backend. Only a 2xx status counts as healthy.
    async fn probe(&self, backend: &Backend) -> bool {
        match backend.transport().probe(&self.path, self.timeout).await {
            Ok(status) if status.is_success() => true,
            Ok(status) => {
                debug!(
                    backend = %backend,
                    status = status.as_u16(),
                    "health probe returned non-success status"
                );
                false
            }
            Err(e) => {
                debug!(backend = %backend, error = %e, "health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(200),
            path: "/health".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_transitions_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry: Arc<BackendRegistry> = Arc::new(
            [Arc::new(Backend::new(format!("http://{}", addr)).unwrap())]
                .into_iter()
                .collect(),
        );
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            &test_config(),
            MetricsCollector::new(),
        );

        let first = monitor.check_all().await;
        assert_eq!(
            first,
            vec![HealthTransition {
                address: format!("http://{}", addr),
                healthy: false,
            }]
        );
        assert_eq!(registry.healthy_count(), 0);

        // Still down: no new transition
        assert!(monitor.check_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_cycle() {
        let monitor = HealthMonitor::new(
            Arc::new(BackendRegistry::new()),
            &test_config(),
            MetricsCollector::new(),
        );
        assert!(monitor.check_all().await.is_empty());
    }
}
