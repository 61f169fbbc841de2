//! Configuration loading, parsing, and validation.

mod loader;
mod types;
mod validation;

pub use loader::{ConfigError, load_config, read_config};
pub use types::*;
pub use validation::validate_config;
