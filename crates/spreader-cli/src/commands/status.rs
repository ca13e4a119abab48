//! `status` - read-only look at the wallet under the current policy

use anyhow::Context;
use rust_decimal::Decimal;
use std::sync::Arc;

use spreader_core::{select_target, CatalogSnapshot, EntryCatalog};
use spreader_ledger::{CliLedger, LedgerClient};

use crate::config::SpreaderConfig;
use crate::display;

pub async fn status(config: &SpreaderConfig, amount_per_split: Option<Decimal>) -> anyhow::Result<()> {
    let ledger = Arc::new(CliLedger::new(config.ledger.client_config()));

    display::section("Wallet Status");
    display::kv("CLI", &config.ledger.cli_path.display().to_string());
    display::kv("Network", &config.ledger.network.to_string());

    let height = ledger
        .current_height()
        .await
        .context("wallet did not report a block height")?;
    display::kv("Block height", &height.to_string());

    let snapshot = EntryCatalog::new(ledger.clone()).refresh().await;
    let entries = match &snapshot {
        CatalogSnapshot::Unavailable(e) => {
            display::error(&format!("Could not list entries: {}", e));
            return Ok(());
        }
        CatalogSnapshot::Empty => {
            display::warning("No unlocked entries");
            return Ok(());
        }
        CatalogSnapshot::Entries(entries) => entries,
    };
    display::kv("Unlocked entries", &entries.len().to_string());
    display::kv("Unlocked value", &snapshot.total_value().to_string());

    let Some(amount) = amount_per_split else {
        display::info("Pass --amount to see the next target");
        return Ok(());
    };

    let policy = config.policy.spread_policy(amount);
    println!();
    match select_target(entries, &policy.selection()) {
        Some(target) => {
            display::success(&format!(
                "Next target: {} ({} at {} confirmations)",
                target.id, target.amount, target.confirmations
            ));
            let amounts = policy
                .split_amounts(target.amount)
                .context("target cannot fund the fan-out")?;
            if let Some(each) = amounts.first() {
                display::kv("Outputs", &format!("{} x {}", amounts.len(), each));
            }
        }
        None => display::info(&format!(
            "Nothing eligible: need {} with {} confirmations",
            policy.threshold(),
            policy.min_confirmations
        )),
    }
    Ok(())
}
