//! Spreader Ledger - The wallet engine as seen by the coordinator
//!
//! The coordinator never touches wallet internals. Everything it needs is the
//! `LedgerClient` contract below:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | `list_entries` | Entries currently visible (unlocked) |
//! | `current_height` | Chain height |
//! | `set_all_visible` | Bulk lock/unlock |
//! | `set_visible` | Selective lock/unlock |
//! | `new_destination` | Fresh receiving address |
//! | `broadcast_fan_out` | One multi-output spend, inputs picked by the wallet |
//! | `set_background_consumer_enabled` | Best-effort competitor toggle |
//!
//! Two implementations ship here: `CliLedger`, which drives the wallet's RPC
//! command-line tool, and `InMemoryLedger`, a fake with the same contract
//! plus a `Competitor` actor for tests.

use async_trait::async_trait;
use rust_decimal::Decimal;

use spreader_types::{Destination, Entry, EntryId, Result, TxId};

pub mod cli;
pub mod memory;

pub use cli::{CliLedger, CliLedgerConfig, Network};
pub use memory::{Competitor, CompetitorHandle, InMemoryLedger, LedgerEvent};

/// Contract the coordinator consumes.
///
/// The visibility flags are the only synchronisation channel shared with the
/// competitor. Implementations must apply them in the order they are called.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Entries the ledger currently reports as spendable and visible.
    async fn list_entries(&self) -> Result<Vec<Entry>>;

    async fn current_height(&self) -> Result<u64>;

    /// Lock (`false`) or unlock (`true`) every entry. Unlocking when nothing
    /// is locked must succeed.
    async fn set_all_visible(&self, visible: bool) -> Result<()>;

    /// Lock or unlock the given entries. An empty slice is a no-op.
    async fn set_visible(&self, entries: &[EntryId], visible: bool) -> Result<()>;

    async fn new_destination(&self) -> Result<Destination>;

    /// Broadcast a single transaction paying every `(destination, amount)`.
    /// `Ok(None)` means the ledger produced no transaction.
    async fn broadcast_fan_out(&self, outputs: &[(Destination, Decimal)]) -> Result<Option<TxId>>;

    /// Keep the competitor alive. Failures are swallowed by implementations.
    async fn set_background_consumer_enabled(&self, enabled: bool);
}
