//! CliLedger - drives the wallet through its RPC command-line tool
//!
//! Every operation spawns `<cli> [-datadir=..] [-testnet] <method> <args..>`
//! and reads stdout. The reply is JSON when it parses as JSON, otherwise the
//! trimmed text (addresses and txids come back bare).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use spreader_types::{Destination, Entry, EntryId, Result, SpreaderError, TxId};

use crate::LedgerClient;

/// Chain the wallet runs against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            other => Err(format!("unknown network '{}', expected mainnet or testnet", other)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

/// Where the wallet CLI lives and how to call it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliLedgerConfig {
    /// Path to the wallet's RPC CLI binary
    pub cli_path: PathBuf,
    /// Optional `-datadir` override
    pub data_dir: Option<PathBuf>,
    pub network: Network,
    /// Outer timeout applied to every call
    pub rpc_timeout: Duration,
    /// RPC method that switches the background consumer on/off
    pub consumer_toggle_method: String,
}

impl Default for CliLedgerConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("./src/kore-cli"),
            data_dir: None,
            network: Network::Mainnet,
            rpc_timeout: Duration::from_secs(30),
            consumer_toggle_method: "staking".to_string(),
        }
    }
}

/// Raw stdout of one call
#[derive(Debug, Clone)]
struct Reply {
    raw: String,
}

impl Reply {
    fn text(&self) -> &str {
        self.raw.trim()
    }

    fn is_empty(&self) -> bool {
        self.text().is_empty()
    }

    fn json(&self, call: &str) -> Result<Value> {
        serde_json::from_str(self.text()).map_err(|e| SpreaderError::malformed(call, e.to_string()))
    }
}

/// One row of `listunspent`
#[derive(Debug, Deserialize)]
struct UnspentRecord {
    txid: String,
    vout: u32,
    #[serde(default)]
    address: Option<String>,
    amount: serde_json::Number,
    #[serde(default)]
    confirmations: i64,
}

impl UnspentRecord {
    fn into_entry(self) -> Result<Entry> {
        let amount = parse_amount(&self.amount)?;
        let confirmations = self.confirmations.clamp(0, u32::MAX as i64) as u32;
        let mut entry = Entry::new(EntryId::new(self.txid, self.vout), amount, confirmations);
        entry.address = self.address;
        Ok(entry)
    }
}

/// Parse a JSON number through its literal text, never through f64 arithmetic.
fn parse_amount(number: &serde_json::Number) -> Result<Decimal> {
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| SpreaderError::malformed("listunspent", format!("amount '{}': {}", text, e)))
}

/// `listunspent` with `minconf=0`: unconfirmed change and fresh rewards are
/// spendable by the wallet's coin selection, so they must be listed to be
/// locked.
fn list_unspent_args() -> Vec<String> {
    vec!["0".to_string()]
}

fn outpoints(ids: &[EntryId]) -> Value {
    Value::Array(
        ids.iter()
            .map(|id| json!({ "txid": id.txid, "vout": id.vout }))
            .collect(),
    )
}

pub struct CliLedger {
    config: CliLedgerConfig,
}

impl CliLedger {
    pub fn new(config: CliLedgerConfig) -> Self {
        Self { config }
    }

    /// Arguments placed before the RPC method name
    pub fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(dir) = &self.config.data_dir {
            args.push(format!("-datadir={}", dir.display()));
        }
        if self.config.network == Network::Testnet {
            args.push("-testnet".to_string());
        }
        args
    }

    async fn call(&self, method: &str, args: &[String]) -> Result<Reply> {
        debug!(method, ?args, "Ledger call");

        let mut command = Command::new(&self.config.cli_path);
        command
            .args(self.base_args())
            .arg(method)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.rpc_timeout, command.output()).await {
            Err(_) => {
                return Err(SpreaderError::Timeout {
                    call: method.to_string(),
                    secs: self.config.rpc_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(SpreaderError::rpc(method, e.to_string())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(SpreaderError::rpc(method, message));
        }

        Ok(Reply {
            raw: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

#[async_trait]
impl LedgerClient for CliLedger {
    async fn list_entries(&self) -> Result<Vec<Entry>> {
        let reply = self.call("listunspent", &list_unspent_args()).await?;
        if reply.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<UnspentRecord> = serde_json::from_value(reply.json("listunspent")?)
            .map_err(|e| SpreaderError::malformed("listunspent", e.to_string()))?;
        records.into_iter().map(UnspentRecord::into_entry).collect()
    }

    async fn current_height(&self) -> Result<u64> {
        let reply = self.call("getblockcount", &[]).await?;
        reply
            .text()
            .parse::<u64>()
            .map_err(|e| SpreaderError::malformed("getblockcount", format!("'{}': {}", reply.text(), e)))
    }

    async fn set_all_visible(&self, visible: bool) -> Result<()> {
        if visible {
            self.call("lockunspent", &["true".to_string()]).await?;
            return Ok(());
        }
        let ids: Vec<EntryId> = self.list_entries().await?.into_iter().map(|e| e.id).collect();
        self.set_visible(&ids, false).await
    }

    async fn set_visible(&self, entries: &[EntryId], visible: bool) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let args = [visible.to_string(), outpoints(entries).to_string()];
        let reply = self.call("lockunspent", &args).await?;
        if reply.text() == "false" {
            return Err(SpreaderError::rpc("lockunspent", "wallet refused the lock change"));
        }
        Ok(())
    }

    async fn new_destination(&self) -> Result<Destination> {
        let reply = self.call("getnewaddress", &[]).await?;
        let address = reply.text().trim_matches('"');
        if address.is_empty() {
            return Err(SpreaderError::malformed("getnewaddress", "empty address"));
        }
        Ok(Destination::new(address))
    }

    async fn broadcast_fan_out(&self, outputs: &[(Destination, Decimal)]) -> Result<Option<TxId>> {
        let mut amounts = Map::new();
        for (destination, amount) in outputs {
            // Amounts go over as strings so no float conversion happens
            amounts.insert(destination.0.clone(), Value::String(amount.normalize().to_string()));
        }
        let args = [String::new(), Value::Object(amounts).to_string()];
        let reply = self.call("sendmany", &args).await?;
        if reply.is_empty() {
            return Ok(None);
        }
        Ok(Some(TxId::new(reply.text().trim_matches('"'))))
    }

    async fn set_background_consumer_enabled(&self, enabled: bool) {
        let method = self.config.consumer_toggle_method.clone();
        if let Err(e) = self.call(&method, &[enabled.to_string()]).await {
            warn!(method = %method, enabled, error = %e, "Background consumer toggle failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn base_args_follow_network_and_datadir() {
        let ledger = CliLedger::new(CliLedgerConfig {
            data_dir: Some(PathBuf::from("/home/mx/.kore")),
            network: Network::Testnet,
            ..Default::default()
        });
        assert_eq!(ledger.base_args(), vec!["-datadir=/home/mx/.kore", "-testnet"]);

        let mainnet = CliLedger::new(CliLedgerConfig::default());
        assert!(mainnet.base_args().is_empty());
    }

    #[test]
    fn unspent_records_keep_exact_amounts() {
        let raw = r#"[
            {"txid": "aa", "vout": 0, "address": "K1", "amount": 5010.12345678, "confirmations": 6},
            {"txid": "bb", "vout": 2, "amount": 1e-8, "confirmations": -1}
        ]"#;
        let records: Vec<UnspentRecord> = serde_json::from_str(raw).unwrap();
        let entries: Vec<Entry> = records.into_iter().map(|r| r.into_entry().unwrap()).collect();

        assert_eq!(entries[0].amount, dec!(5010.12345678));
        assert_eq!(entries[0].address.as_deref(), Some("K1"));
        assert_eq!(entries[1].amount, dec!(0.00000001));
        assert_eq!(entries[1].confirmations, 0);
    }

    #[test]
    fn outpoints_serialize_as_lockunspent_expects() {
        let value = outpoints(&[EntryId::new("aa", 1)]);
        assert_eq!(value.to_string(), r#"[{"txid":"aa","vout":1}]"#);
    }

    #[test]
    fn listing_includes_unconfirmed_entries() {
        assert_eq!(list_unspent_args(), vec!["0"]);
    }

    #[test]
    fn network_parses_case_insensitively() {
        assert_eq!("TestNet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("regtest".parse::<Network>().is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_a_transient_error() {
        let ledger = CliLedger::new(CliLedgerConfig {
            cli_path: PathBuf::from("/nonexistent/kore-cli"),
            ..Default::default()
        });
        let err = ledger.current_height().await.unwrap_err();
        assert!(matches!(err, SpreaderError::TransientRpc { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn empty_visibility_change_spawns_nothing() {
        let ledger = CliLedger::new(CliLedgerConfig {
            cli_path: PathBuf::from("/nonexistent/kore-cli"),
            ..Default::default()
        });
        ledger.set_visible(&[], false).await.unwrap();
    }

    #[tokio::test]
    async fn consumer_toggle_swallows_failures() {
        let ledger = CliLedger::new(CliLedgerConfig {
            cli_path: PathBuf::from("/nonexistent/kore-cli"),
            ..Default::default()
        });
        ledger.set_background_consumer_enabled(true).await;
    }
}
