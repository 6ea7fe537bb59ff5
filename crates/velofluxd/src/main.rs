//! velofluxd: the VeloFlux control-plane daemon.
//!
//! Single binary that assembles the control plane:
//! - Shared state store (Redis, or in-memory for development)
//! - Cluster membership and leader election
//! - Tenant orchestrator and drift watcher
//! - REST API
//!
//! # Usage
//!
//! ```text
//! velofluxd run --config /etc/veloflux/velofluxd.toml
//! velofluxd check-config --config /etc/veloflux/velofluxd.toml
//! ```

mod config;
mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "velofluxd", about = "VeloFlux control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to velofluxd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a config file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = DaemonConfig::load(config.as_deref())?;
            init_tracing(&config.logging);
            config.validate()?;
            daemon::run(config).await
        }
        Command::CheckConfig { config: path } => {
            let config = DaemonConfig::from_file(&path)?;
            config.validate()?;
            println!("{}: ok", path.display());
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}
