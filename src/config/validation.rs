//! Configuration validation.

use crate::config::Config;
use hyper::Uri;
use hyper::header::HeaderName;
use hyper::http::uri::Scheme;
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one backend
/// - Backend addresses are absolute `http://` URLs with a host
/// - No duplicate backend addresses
/// - A positive attempt budget and non-zero timings
/// - A well-formed health path and client IP header
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push("at least one backend must be defined".to_string());
    }

    let mut seen = HashSet::new();
    for address in &config.backends {
        if let Err(e) = validate_backend_address(address) {
            errors.push(e);
        }

        if !seen.insert(address.as_str()) {
            errors.push(format!("duplicate backend address: {}", address));
        }
    }

    if config.proxy.max_retries == 0 {
        errors.push("proxy.max_retries must be at least 1".to_string());
    }

    if config.proxy.attempt_timeout == Duration::ZERO {
        errors.push("proxy.attempt_timeout must be greater than zero".to_string());
    }

    if HeaderName::from_bytes(config.proxy.client_ip_header.as_bytes()).is_err() {
        errors.push(format!(
            "proxy.client_ip_header '{}' is not a valid header name",
            config.proxy.client_ip_header
        ));
    }

    if config.health_check.interval == Duration::ZERO {
        errors.push("health_check.interval must be greater than zero".to_string());
    }

    if config.health_check.timeout == Duration::ZERO {
        errors.push("health_check.timeout must be greater than zero".to_string());
    }

    if !config.health_check.path.starts_with('/') {
        errors.push(format!(
            "health_check.path '{}' must start with '/'",
            config.health_check.path
        ));
    }

    if config.global.metrics.enabled && !config.global.metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            config.global.metrics.path
        ));
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn validate_backend_address(address: &str) -> Result<(), String> {
    let uri: Uri = address
        .parse()
        .map_err(|e| format!("invalid backend address '{}': {}", address, e))?;

    if uri.scheme() != Some(&Scheme::HTTP) {
        return Err(format!(
            "backend address '{}' must use the http scheme",
            address
        ));
    }

    if uri.host().is_none_or(str::is_empty) {
        return Err(format!("backend address '{}' has no host", address));
    }

    Ok(())
}
