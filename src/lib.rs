//! relaylb - an HTTP load balancer with health checking and failover
//!
//! This crate provides:
//! - Round robin and least-connections backend selection
//! - Per-request retry across distinct backends
//! - Passive failure marking plus periodic active health checks
//! - Prometheus metrics

pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod util;

pub use config::Config;
