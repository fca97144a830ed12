//! mad monitoring daemon entry point
//!
//! Loads the JSON configuration, builds the handler registry, starts one
//! poll task per scheduled handler, and serves pages and charts over
//! HTTP until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mad::config::{Config, DEFAULT_CONFIG_PATH, DEFAULT_PORT};
use mad::error::{MadError, Result};
use mad::handler::{ConfigHandler, Handler, Registry, RootHandler};
use mad::{paths, server, CommandHandler, CpuHandler, DaemonMetrics, HandlerKind, Scheduler};

/// Monitoring daemon command line interface
#[derive(Parser)]
#[command(name = "madd")]
#[command(about = "Monitoring daemon serving command output and time-series charts over HTTP")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// HTTP server port; a nonzero Port in the configuration file wins
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration file and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(&cli) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!(config = %cli.config.display(), "Starting monitoring daemon");

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if cli.check_config {
        println!("Configuration is valid: {}", cli.config.display());
        return;
    }
    // A zero or missing Port in the file means "use the flag"
    let port = match config.port {
        Some(port) if port != 0 => port,
        _ => cli.port,
    };

    let registry = match build_registry(&config, &cli.config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to build handler registry: {}", e);
            process::exit(1);
        }
    };

    let metrics = match DaemonMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("Failed to register metrics: {}", e);
            process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

    let scheduler = Scheduler::start(&registry, metrics.clone(), &shutdown_tx, fatal_tx);
    info!(tasks = scheduler.task_count(), "Scheduler started");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let mut server_task = tokio::spawn(server::serve(
        addr,
        registry.clone(),
        metrics.clone(),
        shutdown_tx.subscribe(),
    ));

    let exit_code = tokio::select! {
        _ = wait_for_signal() => {
            info!("Initiating graceful shutdown");
            0
        }
        Some(e) = fatal_rx.recv() => {
            error!("Fatal error: {}", e);
            1
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!("HTTP server failed: {}", e);
                    1
                }
                Err(e) => {
                    error!("HTTP server task panicked: {}", e);
                    1
                }
            }
        }
    };

    // Stop the poll tasks and the server, then wait for them
    let _ = shutdown_tx.send(());
    scheduler.join().await;
    if !server_task.is_finished() {
        let _ = server_task.await;
    }

    info!("Monitoring daemon stopped");
    if exit_code != 0 {
        process::exit(exit_code);
    }
}

/// Initialize logging based on the command line
fn initialize_logging(cli: &Cli) -> Result<()> {
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let parse = |directive: String| {
        directive.parse().map_err(|e| MadError::Generic(format!("bad log directive: {}", e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(parse(format!("mad={}", log_level))?)
        .add_directive(parse(format!("madd={}", log_level))?)
        .add_directive(parse("tokio=warn".to_string())?)
        .add_directive(parse("hyper=warn".to_string())?)
        .add_directive(parse("mio=warn".to_string())?);

    if cli.json_logs {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false)).init();
    }
    Ok(())
}

/// Build the handler registry from the configuration.
///
/// The registry is sealed before the scheduler and HTTP server start,
/// so it never needs a lock afterwards.
fn build_registry(config: &Config, config_path: &Path) -> Result<Registry> {
    let data_root = paths::data_dir();
    let mut registry = Registry::new();

    for conf in &config.handlers {
        let handler: Arc<dyn Handler> = match conf.kind()? {
            HandlerKind::Command => Arc::new(CommandHandler::new(conf, &data_root)?),
            HandlerKind::CpuLoad => Arc::new(CpuHandler::new(conf, &data_root)?),
        };
        info!(path = handler.path(), name = handler.name(), "Registered handler");
        registry.register(handler);
    }

    registry.register(Arc::new(ConfigHandler::new(config_path.to_path_buf())));
    // The index lists everything registered before it
    let entries = registry.entries();
    registry.register(Arc::new(RootHandler::new(entries)));
    Ok(registry)
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT");
        }
    }
}
