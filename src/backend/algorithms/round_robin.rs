//! Round-robin load balancing algorithm.

use crate::backend::{Backend, BackendRegistry};
use std::sync::Arc;

/// Round-robin selection.
///
/// Rotates over the full backend list, including unhealthy entries, so that
/// positions stay stable while health flags change. Unhealthy entries are
/// skipped during the scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl RoundRobin {
    /// Create a new round-robin selector.
    pub fn new() -> Self {
        Self
    }

    /// Select the next healthy backend after the registry cursor.
    pub fn select(&self, registry: &BackendRegistry) -> Option<Arc<Backend>> {
        let backends = registry.all_backends();
        if backends.is_empty() {
            return None;
        }

        let len = backends.len();
        let start = (registry.next_cursor() % len as u64) as usize;

        (0..len)
            .map(|offset| &backends[(start + offset) % len])
            .find(|backend| backend.is_healthy())
            .cloned()
    }
}
