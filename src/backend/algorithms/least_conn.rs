//! Least-connections load balancing algorithm.

use crate::backend::{Backend, BackendRegistry};
use std::sync::Arc;

/// Least-connections selection.
///
/// Sends requests to the healthy backend with the fewest in-flight
/// attempts. Ties go to the backend listed first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastConnections;

impl LeastConnections {
    /// Create a new least-connections selector.
    pub fn new() -> Self {
        Self
    }

    /// Select the healthy backend with the lowest connection count.
    pub fn select(&self, registry: &BackendRegistry) -> Option<Arc<Backend>> {
        let mut min_conns: Option<usize> = None;
        let mut selected = None;

        for backend in registry.healthy_backends() {
            let conns = backend.active_connections();
            if min_conns.is_none_or(|min| conns < min) {
                min_conns = Some(conns);
                selected = Some(backend);
            }
        }

        selected
    }
}
