//! Pango CLI
//!
//! A command-line driver for the Pango tunnel controller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pango_engine::{Config, DryRunEngine, LifecycleState, StartRequest, TunnelController};
use pango_tun::{ControlSocketScanner, LoggingApplier, DEFAULT_SCAN_LIMIT};

/// Pango - tunnel lifecycle controller
#[derive(Parser)]
#[command(name = "pango")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pango.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Control socket path (overrides the configuration file)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up against the in-process dry-run engine
    Run,

    /// Show the state of a running tunnel
    Status,

    /// Print the network settings relayed by a running tunnel
    Settings,

    /// Stop a running tunnel
    Stop,

    /// Look for the utun control socket in this process
    Scan {
        /// Highest descriptor number to inspect
        #[arg(long, default_value_t = DEFAULT_SCAN_LIMIT)]
        limit: i32,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "pango.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => run_tunnel(&cli.config, cli.socket).await,
        Commands::Status => show_status(&cli.config, cli.socket).await,
        Commands::Settings => show_settings(&cli.config, cli.socket).await,
        Commands::Stop => request_stop(&cli.config, cli.socket).await,
        Commands::Scan { limit } => scan(limit),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_tunnel(config_path: &Path, socket: Option<PathBuf>) -> Result<()> {
    info!("Starting Pango tunnel with the dry-run engine...");

    let config = load_config(config_path)?;
    let network = config
        .network_settings()
        .context("Cannot start without [network] settings")?
        .clone();

    info!("Configuration loaded from {:?}", config_path);

    let controller =
        TunnelController::builder(Arc::new(DryRunEngine::new()), Arc::new(LoggingApplier))
            .config(config.controller.clone())
            .build();

    controller
        .initialize_engine(&config.engine)
        .await
        .context("Failed to initialize engine")?;

    let control = spawn_control_server(&controller, socket.or(config.controller.control_socket))?;

    controller
        .start(StartRequest::new(network).with_options(config.tunnel))
        .await
        .context("Failed to start tunnel")?;

    if let Some(handle) = controller.handle() {
        info!("Tunnel running on {}", handle);
    }

    let mut state_rx = controller.subscribe();
    tokio::select! {
        result = wait_for_shutdown() => {
            result.context("Failed to listen for shutdown signals")?;
            info!("Shutting down tunnel...");
            stop_controller(&controller).await?;
        }
        _ = state_rx.wait_for(|state| *state == LifecycleState::Stopped) => {
            info!("Tunnel stopped");
        }
    }

    if let Some(control) = control {
        control.abort();
    }

    Ok(())
}

async fn stop_controller(controller: &TunnelController) -> Result<()> {
    match controller.stop().await {
        Ok(()) => Ok(()),
        // The engine went away on its own between the signal and the stop
        Err(e) if e.is_state_error() => Ok(()),
        Err(e) if !e.is_fatal() => {
            warn!("{}", e);
            Ok(())
        }
        Err(e) => Err(e).context("Failed to stop tunnel"),
    }
}

#[cfg(unix)]
fn spawn_control_server(
    controller: &TunnelController,
    socket: Option<PathBuf>,
) -> Result<Option<tokio::task::JoinHandle<()>>> {
    let Some(path) = socket else {
        return Ok(None);
    };

    let server = pango_engine::ControlServer::bind(&path, controller.clone())
        .with_context(|| format!("Failed to open control socket at {:?}", path))?;
    Ok(Some(tokio::spawn(server.serve())))
}

#[cfg(not(unix))]
fn spawn_control_server(
    _controller: &TunnelController,
    socket: Option<PathBuf>,
) -> Result<Option<tokio::task::JoinHandle<()>>> {
    if socket.is_some() {
        warn!("Control socket is only supported on Unix");
    }
    Ok(None)
}

/// Socket path from the flag, the config file, or the default
#[cfg(unix)]
fn control_client(config_path: &Path, socket: Option<PathBuf>) -> pango_engine::ControlClient {
    let path = socket
        .or_else(|| {
            Config::load(config_path)
                .ok()
                .and_then(|config| config.controller.control_socket)
        })
        .unwrap_or_else(|| PathBuf::from(pango_engine::DEFAULT_SOCKET_PATH));
    pango_engine::ControlClient::new(path)
}

#[cfg(unix)]
async fn show_status(config_path: &Path, socket: Option<PathBuf>) -> Result<()> {
    let status = control_client(config_path, socket).status().await?;

    println!("State:            {}", status.state);
    match status.handle {
        Some(handle) => println!("Handle:           fd {}", handle),
        None => println!("Handle:           -"),
    }
    println!("Settings version: {}", status.settings_version);
    println!("Uptime:           {}s", status.uptime_secs);
    Ok(())
}

#[cfg(unix)]
async fn show_settings(config_path: &Path, socket: Option<PathBuf>) -> Result<()> {
    let (version, json) = control_client(config_path, socket).settings().await?;

    let pretty = serde_json::from_str::<serde_json::Value>(&json)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or(json);
    println!("# version {}", version);
    println!("{}", pretty);
    Ok(())
}

#[cfg(unix)]
async fn request_stop(config_path: &Path, socket: Option<PathBuf>) -> Result<()> {
    control_client(config_path, socket).stop().await?;
    println!("Tunnel stopped.");
    Ok(())
}

#[cfg(not(unix))]
async fn show_status(_config_path: &Path, _socket: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("The control socket is only supported on Unix")
}

#[cfg(not(unix))]
async fn show_settings(_config_path: &Path, _socket: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("The control socket is only supported on Unix")
}

#[cfg(not(unix))]
async fn request_stop(_config_path: &Path, _socket: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("The control socket is only supported on Unix")
}

fn scan(limit: i32) -> Result<()> {
    let scanner = ControlSocketScanner::new().with_limit(limit);
    match scanner.discover() {
        Some(handle) => println!("utun control socket found on {}", handle),
        None => println!("No utun control socket among descriptors 0..={}", scanner.limit()),
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the [tunnel] credentials before running.");

    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
