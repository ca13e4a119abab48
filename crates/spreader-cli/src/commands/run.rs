//! `run` - spread large entries across fresh destinations, round by round

use anyhow::Context;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;

use spreader_core::{RoundScheduler, RunSummary};
use spreader_ledger::{CliLedger, LedgerClient};

use crate::config::{validate_run, SpreaderConfig};
use crate::display;

pub async fn run<F>(
    config: &SpreaderConfig,
    amount_per_split: Decimal,
    rounds: u32,
    shutdown: F,
) -> anyhow::Result<RunSummary>
where
    F: Future<Output = ()>,
{
    validate_run(amount_per_split, rounds)?;

    let policy = config.policy.spread_policy(amount_per_split);
    let ledger: Arc<dyn LedgerClient> = Arc::new(CliLedger::new(config.ledger.client_config()));

    display::section("Stake Spreader");
    display::kv("Target per split", &amount_per_split.to_string());
    display::kv("Splits per tx", &policy.fan_out_width.to_string());
    display::kv("Minimum entry", &policy.threshold().to_string());
    display::kv("Minimum confirmations", &policy.min_confirmations.to_string());
    display::kv("Fan-out mode", &policy.mode.to_string());
    display::kv("Total rounds", &rounds.to_string());
    display::kv("Network", &config.ledger.network.to_string());
    println!();

    let mut scheduler = RoundScheduler::new(ledger, policy, config.schedule.clone(), rounds)
        .context("invalid spend policy")?;

    match scheduler.run_until(shutdown).await {
        Ok(summary) => {
            display::summary(&summary);
            Ok(summary)
        }
        Err(e) => {
            display::error(&format!("Stopped: {}", e));
            display::summary(scheduler.summary());
            Err(e).context("run aborted")
        }
    }
}
