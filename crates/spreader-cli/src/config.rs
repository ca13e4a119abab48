//! Spreader Configuration
//!
//! Layered as: built-in defaults, then an optional config file, then
//! `config/default` and `config/local`, then `SPREADER__*` environment
//! variables. Command-line flags are applied last by `main`.

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use spreader_core::{FanOutMode, ScheduleConfig, SpreadPolicy};
use spreader_ledger::{CliLedgerConfig, Network};

/// Complete spreader configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpreaderConfig {
    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to reach the wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Path to the wallet's RPC CLI binary
    #[serde(default = "default_cli_path")]
    pub cli_path: PathBuf,

    /// Wallet data directory, passed as `-datadir`
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub network: Network,

    /// Outer timeout for each RPC call in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// RPC method that toggles background staking
    #[serde(default = "default_consumer_toggle_method")]
    pub consumer_toggle_method: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            data_dir: None,
            network: Network::default(),
            rpc_timeout_secs: default_rpc_timeout(),
            consumer_toggle_method: default_consumer_toggle_method(),
        }
    }
}

impl LedgerSettings {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn client_config(&self) -> CliLedgerConfig {
        CliLedgerConfig {
            cli_path: self.cli_path.clone(),
            data_dir: self.data_dir.clone(),
            network: self.network,
            rpc_timeout: self.rpc_timeout(),
            consumer_toggle_method: self.consumer_toggle_method.clone(),
        }
    }
}

/// Spend policy knobs; the split amount itself comes from the command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,

    #[serde(default = "default_fan_out_width")]
    pub fan_out_width: usize,

    #[serde(default = "default_fee_buffer")]
    pub fee_buffer: Decimal,

    #[serde(default)]
    pub mode: FanOutMode,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            min_confirmations: default_min_confirmations(),
            fan_out_width: default_fan_out_width(),
            fee_buffer: default_fee_buffer(),
            mode: FanOutMode::default(),
        }
    }
}

impl PolicySettings {
    pub fn spread_policy(&self, amount_per_split: Decimal) -> SpreadPolicy {
        SpreadPolicy {
            amount_per_split,
            fan_out_width: self.fan_out_width,
            fee_buffer: self.fee_buffer,
            min_confirmations: self.min_confirmations,
            mode: self.mode,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// =============================================================================
// Default Functions
// =============================================================================

fn default_cli_path() -> PathBuf {
    PathBuf::from("./src/kore-cli")
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_consumer_toggle_method() -> String {
    "staking".to_string()
}

fn default_min_confirmations() -> u32 {
    1
}

fn default_fan_out_width() -> usize {
    SpreadPolicy::DEFAULT_FAN_OUT_WIDTH
}

fn default_fee_buffer() -> Decimal {
    Decimal::new(1, 2)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl SpreaderConfig {
    /// Load configuration from environment and optional config file
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        builder = builder.add_source(
            config::Environment::with_prefix("SPREADER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to read configuration")?;
        config
            .try_deserialize()
            .context("invalid configuration")
    }

    /// Reject settings that would make a run unsafe or meaningless
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.policy.fan_out_width == 0 {
            anyhow::bail!("policy.fan_out_width must be at least 1");
        }
        if self.policy.fee_buffer < Decimal::ZERO {
            anyhow::bail!("policy.fee_buffer cannot be negative");
        }
        if self.schedule.isolation_delay_secs == 0 {
            anyhow::bail!(
                "schedule.isolation_delay_secs must be positive; the competitor needs time to see the lock"
            );
        }
        if self.schedule.settlement_poll_secs == 0 {
            anyhow::bail!("schedule.settlement_poll_secs must be positive");
        }
        if self.schedule.catalog_retry_ceiling == 0 {
            anyhow::bail!("schedule.catalog_retry_ceiling must be at least 1");
        }
        if self.ledger.rpc_timeout_secs == 0 {
            anyhow::bail!("ledger.rpc_timeout_secs must be positive");
        }
        if self.ledger.consumer_toggle_method.trim().is_empty() {
            anyhow::bail!("ledger.consumer_toggle_method cannot be empty");
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("logging.format must be json or pretty, got '{}'", self.logging.format);
        }
        Ok(())
    }
}

/// Check the `run` arguments themselves
pub fn validate_run(amount_per_split: Decimal, rounds: u32) -> anyhow::Result<()> {
    if amount_per_split <= Decimal::ZERO {
        anyhow::bail!("amount per split must be positive, got {}", amount_per_split);
    }
    if rounds == 0 {
        anyhow::bail!("rounds must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_are_valid() {
        let config = SpreaderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.policy.fan_out_width, 5);
        assert_eq!(config.policy.fee_buffer, dec!(0.01));
        assert_eq!(config.ledger.network, Network::Mainnet);
        assert_eq!(config.schedule.isolation_delay_secs, 5);
    }

    #[test]
    fn zero_isolation_delay_rejected() {
        let mut config = SpreaderConfig::default();
        config.schedule.isolation_delay_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = SpreaderConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn run_arguments_checked() {
        assert!(validate_run(dec!(10), 3).is_ok());
        assert!(validate_run(dec!(0), 3).is_err());
        assert!(validate_run(dec!(-1), 3).is_err());
        assert!(validate_run(dec!(10), 0).is_err());
    }

    #[test]
    fn policy_settings_build_spread_policy() {
        let settings = PolicySettings {
            min_confirmations: 5,
            fee_buffer: dec!(2),
            ..PolicySettings::default()
        };
        let policy = settings.spread_policy(dec!(1000));
        assert_eq!(policy.threshold(), dec!(5002));
        assert_eq!(policy.min_confirmations, 5);
    }

    #[test]
    fn ledger_settings_map_to_client_config() {
        let settings = LedgerSettings {
            data_dir: Some(PathBuf::from("/tmp/wallet")),
            network: Network::Testnet,
            ..LedgerSettings::default()
        };
        let client = settings.client_config();
        assert_eq!(client.network, Network::Testnet);
        assert_eq!(client.rpc_timeout, Duration::from_secs(30));
        assert_eq!(client.data_dir, Some(PathBuf::from("/tmp/wallet")));
    }

    #[test]
    fn partial_sections_deserialize() {
        let config: SpreaderConfig = serde_json::from_str(
            r#"{"policy": {"min_confirmations": 10}, "schedule": {"empty_backoff_secs": 120}}"#,
        )
        .unwrap();
        assert_eq!(config.policy.min_confirmations, 10);
        assert_eq!(config.policy.fan_out_width, 5);
        assert_eq!(config.schedule.empty_backoff_secs, 120);
        assert_eq!(config.logging.level, "info");
    }
}
