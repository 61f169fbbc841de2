//! Backend state, the backend registry, and load balancing algorithms.

pub mod algorithms;
mod registry;
mod server;

pub use algorithms::Strategy;
pub use registry::BackendRegistry;
pub use server::{Backend, ConnectionGuard};
