//! Stake Spreader - split large staking entries into smaller ones
//!
//! Each round picks the biggest mature entry, takes it away from the
//! wallet's background staker just long enough to fan it out to fresh
//! addresses, and hands every other entry straight back.
//!
//! # Usage
//!
//! ```bash
//! # Five rounds of 100-coin splits on testnet
//! stake-spreader --testnet run 100 5
//!
//! # What would the next round spend?
//! stake-spreader status --amount 100
//!
//! # Unlock everything after an unclean exit
//! stake-spreader restore
//!
//! # Environment overrides
//! SPREADER__SCHEDULE__ISOLATION_DELAY_SECS=8 stake-spreader run 100 5
//! ```

mod commands;
mod config;
mod display;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::signal;
use tracing::Instrument;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use spreader_core::FanOutMode;
use spreader_ledger::Network;

use crate::config::{LoggingConfig, SpreaderConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Stake Spreader - fan large entries out without racing the staker
#[derive(Parser, Debug)]
#[command(name = "stake-spreader")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, global = true, env = "SPREADER_CONFIG")]
    config: Option<String>,

    /// Path to the wallet's RPC CLI binary
    #[arg(long = "cli", global = true, env = "SPREADER_CLI")]
    cli_path: Option<PathBuf>,

    /// Wallet data directory
    #[arg(long, global = true, env = "SPREADER_DATADIR")]
    datadir: Option<PathBuf>,

    /// Network (mainnet, testnet)
    #[arg(long, global = true, env = "SPREADER_NETWORK")]
    network: Option<Network>,

    /// Shorthand for --network testnet
    #[arg(long, global = true, conflicts_with = "network")]
    testnet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SPREADER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, global = true, env = "SPREADER_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spread entries for a number of successful rounds
    Run {
        /// Amount each new destination receives
        amount: Decimal,

        /// Successful rounds to complete
        rounds: u32,

        /// Minimum confirmations an entry needs before it is spent
        #[arg(long)]
        min_confirmations: Option<u32>,

        /// Destinations per transaction
        #[arg(long)]
        fan_out: Option<usize>,

        /// Amount held back for the transaction fee
        #[arg(long)]
        fee_buffer: Option<Decimal>,

        /// How outputs are sized (sweep, fixed)
        #[arg(long)]
        mode: Option<FanOutMode>,

        /// Seconds the target stays locked before the swap
        #[arg(long)]
        isolation_delay: Option<u64>,
    },

    /// Show height, unlocked entries and the next target
    Status {
        /// Amount per split to evaluate eligibility against
        #[arg(long)]
        amount: Option<Decimal>,

        /// Minimum confirmations an entry needs before it is spent
        #[arg(long)]
        min_confirmations: Option<u32>,
    },

    /// Unlock every entry and re-enable staking
    Restore,
}

impl Cli {
    /// Command-line flags win over every other configuration layer
    fn apply_overrides(&self, config: &mut SpreaderConfig) {
        if let Some(path) = &self.cli_path {
            config.ledger.cli_path = path.clone();
        }
        if let Some(dir) = &self.datadir {
            config.ledger.data_dir = Some(dir.clone());
        }
        if let Some(network) = self.network {
            config.ledger.network = network;
        }
        if self.testnet {
            config.ledger.network = Network::Testnet;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }

        match &self.command {
            Commands::Run {
                min_confirmations,
                fan_out,
                fee_buffer,
                mode,
                isolation_delay,
                ..
            } => {
                if let Some(depth) = min_confirmations {
                    config.policy.min_confirmations = *depth;
                }
                if let Some(width) = fan_out {
                    config.policy.fan_out_width = *width;
                }
                if let Some(fee) = fee_buffer {
                    config.policy.fee_buffer = *fee;
                }
                if let Some(mode) = mode {
                    config.policy.mode = *mode;
                }
                if let Some(secs) = isolation_delay {
                    config.schedule.isolation_delay_secs = *secs;
                }
            }
            Commands::Status {
                min_confirmations: Some(depth),
                ..
            } => config.policy.min_confirmations = *depth,
            _ => {}
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut spreader_config = SpreaderConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut spreader_config);

    init_logging(&spreader_config.logging)?;
    spreader_config.validate()?;

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("spreader", %run_id);

    async move {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            network = %spreader_config.ledger.network,
            cli = %spreader_config.ledger.cli_path.display(),
            "Starting stake spreader"
        );

        match cli.command {
            Commands::Run { amount, rounds, .. } => {
                commands::run::run(&spreader_config, amount, rounds, shutdown_signal()).await?;
            }
            Commands::Status { amount, .. } => {
                commands::status::status(&spreader_config, amount).await?;
            }
            Commands::Restore => {
                commands::restore::restore(&spreader_config).await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

// =============================================================================
// Initialization
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_target(true))
                .try_init()?;
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_target(false))
                .try_init()?;
        }
    }

    Ok(())
}

// =============================================================================
// Shutdown
// =============================================================================

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, unlocking entries before exit...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, unlocking entries before exit...");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
