//! Ordered, concurrency-safe collection of backends.

use crate::backend::Backend;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Registry of all backends plus the shared round-robin cursor.
///
/// Callers only ever see snapshots of the backend list, so no lock is held
/// while they scan it or perform I/O against a backend.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    /// Backends in insertion order.
    backends: RwLock<Vec<Arc<Backend>>>,
    /// Monotonic selection cursor.
    cursor: AtomicU64,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend.
    pub fn add(&self, backend: Arc<Backend>) {
        debug!(backend = %backend.address(), "registering backend");
        self.backends.write().push(backend);
    }

    /// Snapshot of every backend, healthy or not.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    /// Snapshot of the backends whose health flag is currently set.
    pub fn healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    /// Advance the cursor and return its previous value.
    ///
    /// This is the value before the increment, not after it: the first call
    /// returns 0, so round robin starts at the first registered backend.
    /// Every call observes a distinct value; callers reduce it modulo the
    /// snapshot length themselves.
    pub fn next_cursor(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Set the health flag of the backend with the given address.
    ///
    /// Returns the previous flag, or `None` if no backend matches.
    pub fn mark_health(&self, address: &str, healthy: bool) -> Option<bool> {
        let backend = self
            .backends
            .read()
            .iter()
            .find(|b| b.address() == address)
            .cloned()?;

        Some(backend.set_healthy(healthy))
    }

    /// Number of registered backends.
    pub fn count(&self) -> usize {
        self.backends.read().len()
    }

    /// Number of backends currently marked healthy.
    pub fn healthy_count(&self) -> usize {
        self.backends.read().iter().filter(|b| b.is_healthy()).count()
    }
}

impl FromIterator<Arc<Backend>> for BackendRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<Backend>>>(iter: I) -> Self {
        Self {
            backends: RwLock::new(iter.into_iter().collect()),
            cursor: AtomicU64::new(0),
        }
    }
}
