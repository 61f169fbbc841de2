//! Active health monitoring for backend servers.

mod monitor;

pub use monitor::{HealthMonitor, HealthTransition};
