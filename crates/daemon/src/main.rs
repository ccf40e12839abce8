//! RemoVault daemon entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use daemon::broker_client::BrokerClient;
use daemon::config::{default_config_path, Config};
use daemon::server::Server;

/// Multi-user remote file service.
#[derive(Debug, Parser)]
#[command(name = "removault-daemon", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon (the default when no command is given).
    Run,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the default configuration file path.
    Path,
    /// Write a default configuration file.
    Init,
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("daemon={level},removault_daemon={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load {}", path.display()))?
        }
        None => Config::load_default().context("failed to load configuration")?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigAction::Path => {
                println!("{}", default_config_path().display());
                Ok(())
            }
            ConfigAction::Init => {
                let path = default_config_path();
                Config::default().save(&path)?;
                println!("Wrote {}", path.display());
                Ok(())
            }
        },
    }
}

async fn run(config: Config) -> Result<()> {
    init_logging(&config.daemon.log_level);

    info!(
        addr = %config.server.bind_addr,
        port = config.server.port,
        broker = %config.broker.socket_path.display(),
        "Starting RemoVault daemon"
    );

    let broker = BrokerClient::new(
        config.broker.socket_path.clone(),
        Duration::from_secs(config.broker.request_timeout_secs),
    );
    if let Err(e) = broker.probe().await {
        // The broker may come up later; clients see per-request errors
        // until it does.
        warn!(error = %e, "Broker not reachable at startup");
    }

    let server = Server::bind(&config).await?;

    tokio::select! {
        result = server.run() => result.context("server failed"),
        _ = wait_for_shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
