//! TermLink - terminal connection endpoint
//!
//! Runs the connection acceptor (or outbound connector) on its own, with a
//! registry host that logs received payloads and can echo them back.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use termlink::config::{Config, ConfigManager, CreatorKind};
use termlink::connection::{CompressionMode, SecurityMode};
use termlink::host::HostEvent;
use termlink::{ConnectionCreator, ConnectionRegistry, Creator, ShutdownCoordinator};

/// CLI arguments for TermLink
#[derive(Parser, Debug)]
#[command(name = "termlink")]
#[command(about = "TermLink - terminal connection endpoint")]
#[command(version)]
#[command(long_about = "
TermLink - terminal connection endpoint

Accepts inbound stream connections (or dials one outbound connection) and
manages each connection's lifecycle.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TERMLINK_BIND_ADDR           - Endpoint address (e.g., 127.0.0.1:4040)
  TERMLINK_BACKLOG             - Listen backlog (0-255)
  TERMLINK_CONCURRENT_ACCEPTS  - Outstanding accept operations (0-255)
  TERMLINK_BUFFER_SIZE         - Socket buffer size in bytes
  TERMLINK_SHUTDOWN_TIMEOUT    - Shutdown timeout (e.g., 10s)
  TERMLINK_LOG_LEVEL           - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "termlink.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Endpoint address (overrides config file)
    #[arg(short, long, help = "Endpoint address (e.g., 127.0.0.1:4040)")]
    pub bind: Option<String>,

    /// Port (overrides config file)
    #[arg(short, long, help = "Endpoint port")]
    pub port: Option<u16>,

    /// Dial the endpoint instead of listening on it
    #[arg(long, help = "Connect to the endpoint instead of listening")]
    pub connect: bool,

    #[arg(long, help = "Listen backlog (0-255)")]
    pub backlog: Option<u8>,

    #[arg(long, help = "Number of concurrently outstanding accepts (0-255)")]
    pub concurrent_accepts: Option<u8>,

    #[arg(long, help = "Socket buffer size in bytes")]
    pub buffer_size: Option<usize>,

    #[arg(long, help = "Echo received payloads back to the sender")]
    pub echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.connect,
        args.backlog,
        args.concurrent_accepts,
        args.buffer_size,
        args.echo,
    )?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config.logging.level)?;

    info!("Starting TermLink v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Mode: {}", config.endpoint.mode);
        info!("  Endpoint: {}", config.endpoint.addr);
        info!("  Backlog: {}", config.endpoint.backlog);
        info!("  Concurrent accepts: {}", config.endpoint.concurrent_accepts);
        info!("  Security: {}", config.endpoint.security);
        info!("  Compression: {}", config.endpoint.compression);
        info!("  Socket buffer size: {} bytes", config.host.socket_buffer_size);
        info!("  Shutdown timeout: {:?}", config.shutdown.timeout);
        return Ok(());
    }

    ensure_supported_modes(&config)?;

    let registry = Arc::new(ConnectionRegistry::new(config.host.socket_buffer_size).with_echo(config.host.echo));
    let creator = Creator::new(config.endpoint.mode, config.listener_config(None), registry.clone());

    let event_logger = spawn_event_logger(&registry);

    match &creator {
        Creator::Listener(acceptor) => {
            let local_addr = acceptor.start().context("Failed to start listener")?;
            info!(
                "Listening on {} with {} concurrent accepts",
                local_addr, config.endpoint.concurrent_accepts
            );
        }
        Creator::Connector(_) => {
            creator.start().context("Failed to start connector")?;
        }
    }

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let shutdown_coordinator = ShutdownCoordinator::new(config.shutdown.timeout);
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    let report = shutdown_coordinator.shutdown_creator(&creator, &registry).await;
    debug!("Shutdown report: {:?}", report);

    if let Creator::Listener(acceptor) = &creator {
        info!("Acceptor statistics: {:?}", acceptor.stats());
    }
    info!("Host statistics: {:?}", registry.stats());

    event_logger.abort();
    if config.endpoint.mode == CreatorKind::Connect && registry.stats().total_added == 0 {
        warn!("Outbound connection was never established");
    }

    info!("Shutdown complete");
    Ok(())
}

/// The standalone binary ships neither a crypto provider nor a compressor
fn ensure_supported_modes(config: &Config) -> Result<()> {
    if config.endpoint.security != SecurityMode::None {
        bail!(
            "security mode '{}' needs a crypto provider, which the standalone binary does not ship",
            config.endpoint.security
        );
    }

    if config.endpoint.compression != CompressionMode::None {
        bail!(
            "compression mode '{}' needs a compressor, which the standalone binary does not ship",
            config.endpoint.compression
        );
    }

    Ok(())
}

/// Log received payloads as they arrive
fn spawn_event_logger(registry: &ConnectionRegistry) -> tokio::task::JoinHandle<()> {
    let mut events = registry.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HostEvent::Received { id, payload }) => {
                    info!("{} <- {:?}", id, String::from_utf8_lossy(&payload));
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
