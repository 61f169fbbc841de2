//! relaylb - an HTTP load balancer with health checking and failover
//!
//! Usage:
//!     relaylb --backends http://10.0.0.1:8080,http://10.0.0.2:8080
//!     relaylb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use relaylb::backend::{Backend, BackendRegistry, Strategy};
use relaylb::config::{Config, read_config, validate_config};
use relaylb::frontend::FrontendListener;
use relaylb::health::HealthMonitor;
use relaylb::metrics::{MetricsCollector, MetricsServer};
use relaylb::proxy::{ProxyEngine, ProxyEngineConfig};
use relaylb::util::{ShutdownSignal, init_logging, wait_for_signal};

/// An HTTP load balancer with health checking and failover.
#[derive(Parser, Debug)]
#[command(name = "relaylb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Comma-separated list of backend URLs
    #[arg(long, value_name = "URLS", value_delimiter = ',')]
    backends: Option<Vec<String>>,

    /// Load balancing algorithm (roundrobin, leastconn)
    #[arg(long, value_name = "ALGORITHM")]
    algorithm: Option<String>,

    /// Interval between health check cycles (e.g. 10s)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    health_interval: Option<Duration>,

    /// Timeout for a single health probe (e.g. 2s)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    health_timeout: Option<Duration>,

    /// Maximum forwarding attempts per request
    #[arg(long, value_name = "N")]
    max_retries: Option<usize>,

    /// Deadline for each forwarding attempt (e.g. 30s)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    attempt_timeout: Option<Duration>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Cli {
    /// Apply command line overrides on top of the file (or default) config.
    fn apply(self, mut config: Config) -> Config {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(backends) = self.backends {
            config.backends = backends
                .into_iter()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect();
        }
        if let Some(algorithm) = self.algorithm {
            config.algorithm = algorithm;
        }
        if let Some(interval) = self.health_interval {
            config.health_check.interval = interval;
        }
        if let Some(timeout) = self.health_timeout {
            config.health_check.timeout = timeout;
        }
        if let Some(max_retries) = self.max_retries {
            config.proxy.max_retries = max_retries;
        }
        if let Some(attempt_timeout) = self.attempt_timeout {
            config.proxy.attempt_timeout = attempt_timeout;
        }
        if let Some(level) = self.log_level {
            config.global.log_level = level;
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let validate_only = cli.validate;

    let config = match &cli.config {
        Some(path) => read_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };
    let config = cli.apply(config);

    if let Err(e) = validate_config(&config) {
        bail!("configuration validation failed: {}", e);
    }

    init_logging(&config.global.log_level, &config.global.log_format);

    if validate_only {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!("  Algorithm: {}", Strategy::from_token(&config.algorithm));
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {}", backend);
        }
        return Ok(());
    }

    run(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point for the load balancer.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    let registry = Arc::new(BackendRegistry::new());
    for address in &config.backends {
        let backend = Backend::new(address.as_str())
            .with_context(|| format!("invalid backend address '{}'", address))?;
        metrics.set_backend_health(backend.address(), true);
        info!(backend = %backend, "configured backend");
        registry.add(Arc::new(backend));
    }

    let strategy = Strategy::from_token(&config.algorithm);
    info!(strategy = %strategy, "using load balancing strategy");

    let engine_config = ProxyEngineConfig::try_from(&config.proxy)
        .context("invalid proxy.client_ip_header")?;
    let engine = Arc::new(ProxyEngine::new(
        Arc::clone(&registry),
        strategy,
        engine_config,
        metrics.clone(),
    ));

    let mut handles = Vec::new();

    let monitor = HealthMonitor::new(Arc::clone(&registry), &config.health_check, metrics.clone());
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        monitor.run(shutdown_rx).await;
    }));

    let listener = FrontendListener::bind(config.listen, engine)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        listener.run(shutdown_rx).await;
    }));

    if config.global.metrics.enabled {
        let server = MetricsServer::new(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            metrics.clone(),
        );
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            server.run(shutdown_rx).await;
        }));
    }

    info!(
        listen = %config.listen,
        backends = registry.count(),
        "relaylb is running"
    );
    info!("press Ctrl+C to stop");

    wait_for_signal().await;

    shutdown.shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    info!("relaylb shut down complete");
    Ok(())
}
