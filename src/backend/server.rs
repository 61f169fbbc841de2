//! Per-backend state: health flag, active connection count, transport.

use crate::proxy::{Transport, TransportError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A registered upstream server.
///
/// The health flag sits behind a reader/writer lock since it is read on
/// every selection and written rarely. The connection counter is a plain
/// atomic and never takes that lock.
pub struct Backend {
    /// Base address as configured, used for identity comparisons.
    address: String,
    /// Whether the backend currently accepts traffic.
    healthy: RwLock<bool>,
    /// Forwarding attempts currently in flight.
    active_connections: AtomicUsize,
    /// Outbound client bound to `address`.
    transport: Transport,
}

impl Backend {
    /// Create a healthy backend for the given base address.
    pub fn new(address: impl Into<String>) -> Result<Self, TransportError> {
        let address = address.into();
        let transport = Transport::new(&address)?;

        Ok(Self {
            address,
            healthy: RwLock::new(true),
            active_connections: AtomicUsize::new(0),
            transport,
        })
    }

    /// The backend's base address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Set the health flag, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        let mut guard = self.healthy.write();
        std::mem::replace(&mut *guard, healthy)
    }

    /// Read the health flag.
    pub fn is_healthy(&self) -> bool {
        *self.healthy.read()
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the connection count. Saturates at zero.
    ///
    /// A decrement without a matching increment is a bug in the caller and
    /// trips a debug assertion.
    pub fn decrement_connections(&self) {
        let result = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        debug_assert!(
            result.is_ok(),
            "unmatched connection decrement on {}",
            self.address
        );
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Count one in-flight attempt until the returned guard is dropped.
    ///
    /// The guard owns a handle to the backend, so it can travel with a
    /// response body after the forwarding call has returned.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.increment_connections();
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// The outbound transport for this backend.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("healthy", &self.is_healthy())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Decrements the owning backend's connection count on drop.
///
/// Holding the count in a guard keeps increment and decrement paired even
/// when the request task is cancelled mid-attempt.
#[must_use = "the connection is released as soon as the guard is dropped"]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    /// The backend this guard counts against.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionGuard")
            .field(&self.backend.address)
            .finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}
