//! Parcela messaging core - main entry point
//!
//! Connects to the broker, keeps the device store in sync with device
//! announcements and serves the health endpoint until SIGINT/SIGTERM.

use chrono::Utc;
use clap::{Parser, Subcommand};
use parcela::config::ParcelaConfig;
use parcela::messaging::MessagingService;
use parcela::observability::{init_logging, metrics, HealthServer, LoggingOptions};
use parcela::store::MemoryStore;
use parcela::transport::MqttSessionFactory;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["parcela.toml", "config/parcela.toml"];

/// Parcela device liveness and alarm command core
#[derive(Parser)]
#[command(name = "parcela")]
#[command(about = "Device liveness and alarm command delivery for Parcela lockers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PARCELA_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the messaging core
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingOptions::from_env(|name| std::env::var(name).ok());
    if cli.verbose > 0 {
        logging = logging.verbose();
    }
    init_logging(&logging);

    info!("Starting parcela v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<ParcelaConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ParcelaConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ParcelaConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(ParcelaConfig::from_env(|name| std::env::var(name).ok())?)
}

async fn run_service(config: ParcelaConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::from_seed(&config.store, Utc::now())?);
    info!(
        devices = config.store.devices.len(),
        records = config.store.records.len(),
        "Device store seeded"
    );

    let service =
        MessagingService::from_config(&config, Arc::new(MqttSessionFactory), store.clone())?;

    let health_task = config.service.health_port.map(|port| {
        let server = Arc::new(HealthServer::new(
            "parcela",
            port,
            service.connection().clone(),
        ));
        tokio::spawn(server.start())
    });

    service.start().await?;

    // The session keeps retrying in the background, so a slow broker is not fatal
    let timeout = config.dispatch.initial_connect_timeout();
    match service.wait_until_connected(timeout).await {
        Ok(()) => info!("Connected to broker"),
        Err(e) => warn!(
            error = %e,
            timeout_secs = timeout.as_secs(),
            "Broker not reachable yet, continuing to retry in the background"
        ),
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Parcela is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    service.shutdown().await;
    if let Some(task) = health_task {
        task.abort();
    }

    let snapshot = metrics().get_metrics();
    info!(
        messages_received = snapshot.inbound.messages_received,
        commands_published = snapshot.commands.published,
        commands_failed = snapshot.commands.failed,
        "Final messaging counters"
    );
    Ok(())
}

fn handle_config_command(
    config: &ParcelaConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Credentials resolve here too so a missing variable surfaces before `run`
    let options = config.session_options()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
        println!("# client_id = \"{}\"", options.client_id);
    }

    info!("Configuration validation complete");
    Ok(())
}
