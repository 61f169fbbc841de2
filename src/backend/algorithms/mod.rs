//! Load balancing algorithms.

mod least_conn;
mod round_robin;

pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;

use crate::backend::{Backend, BackendRegistry};
use std::fmt;
use std::sync::Arc;

/// Backend selection policy, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
}

impl Strategy {
    /// Build a strategy from a configuration token.
    ///
    /// `leastconn` and `leastconnections` (any case) select least
    /// connections; every other token selects round robin.
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "leastconn" | "leastconnections" => Self::LeastConnections(LeastConnections::new()),
            _ => Self::RoundRobin(RoundRobin::new()),
        }
    }

    /// Select the next backend.
    ///
    /// # Returns
    ///
    /// The selected backend, or None if no healthy backend is registered.
    pub fn select_next(&self, registry: &BackendRegistry) -> Option<Arc<Backend>> {
        match self {
            Self::RoundRobin(rr) => rr.select(registry),
            Self::LeastConnections(lc) => lc.select(registry),
        }
    }

    /// Human-readable algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin(_) => "Round Robin",
            Self::LeastConnections(_) => "Least Connections",
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::RoundRobin(RoundRobin::new())
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
