//! `restore` - manual recovery after an unclean exit

use anyhow::Context;

use spreader_core::restore_all;
use spreader_ledger::CliLedger;

use crate::config::SpreaderConfig;
use crate::display;

pub async fn restore(config: &SpreaderConfig) -> anyhow::Result<()> {
    let ledger = CliLedger::new(config.ledger.client_config());

    display::section("Restore");
    restore_all(&ledger)
        .await
        .context("could not unlock entries")?;

    display::success("All entries unlocked");
    display::success("Background staking enabled");
    Ok(())
}
