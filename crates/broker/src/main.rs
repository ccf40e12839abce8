//! RemoVault broker entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use broker::{BrokerService, Confinement, FileOps, MemoryAccounts, SystemAccounts};

/// Privileged filesystem and account service for RemoVault.
#[derive(Debug, Parser)]
#[command(name = "removault-broker", version, about)]
struct Cli {
    /// Path of the Unix socket to listen on.
    #[arg(long, default_value = "/run/removault/broker.sock")]
    socket: PathBuf,

    /// Storage root containing the per-user home directories.
    #[arg(long, default_value = "/srv/removault")]
    root: PathBuf,

    /// Use an in-memory account store instead of the system user database.
    ///
    /// For development and testing only: accounts vanish on restart and no
    /// real ownership is assigned.
    #[arg(long)]
    memory_accounts: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("broker={level},removault_broker={level}")));

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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Some(parent) = cli.socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }
    std::fs::create_dir_all(&cli.root)
        .with_context(|| format!("failed to create storage root {}", cli.root.display()))?;

    let confinement = Confinement::new(&cli.root)
        .with_context(|| format!("invalid storage root {}", cli.root.display()))?;
    let ops = FileOps::new(confinement);

    info!(
        socket = %cli.socket.display(),
        root = %cli.root.display(),
        "Starting RemoVault broker"
    );

    if cli.memory_accounts {
        warn!("Using in-memory accounts; all state is lost on restart");
        let service = BrokerService::bind(&cli.socket, ops, MemoryAccounts::new())?;
        run_until_shutdown(service.run()).await
    } else {
        let service = BrokerService::bind(&cli.socket, ops, SystemAccounts::new())?;
        run_until_shutdown(service.run()).await
    }
}

async fn run_until_shutdown<F>(service: F) -> Result<()>
where
    F: std::future::Future<Output = std::result::Result<(), broker::service::ServiceError>>,
{
    tokio::select! {
        result = service => result.context("broker service failed"),
        _ = wait_for_shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_verifies() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["removault-broker"]);
        assert_eq!(cli.socket, PathBuf::from("/run/removault/broker.sock"));
        assert_eq!(cli.root, PathBuf::from("/srv/removault"));
        assert!(!cli.memory_accounts);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "removault-broker",
            "--socket",
            "/tmp/b.sock",
            "--root",
            "/tmp/root",
            "--memory-accounts",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.socket, PathBuf::from("/tmp/b.sock"));
        assert!(cli.memory_accounts);
        assert_eq!(cli.log_level, "debug");
    }
}
