//! Entry catalog: one fresh snapshot of the ledger per round

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

use spreader_ledger::LedgerClient;
use spreader_types::{Entry, SpreaderError};

/// Result of a catalog refresh.
///
/// `Unavailable` (the ledger could not be read) and `Empty` (the ledger
/// answered with nothing) are kept apart so the scheduler can back off
/// differently for each.
#[derive(Debug, Clone)]
pub enum CatalogSnapshot {
    Unavailable(SpreaderError),
    Empty,
    Entries(Vec<Entry>),
}

impl CatalogSnapshot {
    pub fn entries(&self) -> &[Entry] {
        match self {
            Self::Entries(entries) => entries,
            _ => &[],
        }
    }

    pub fn total_value(&self) -> Decimal {
        self.entries().iter().map(|e| e.amount).sum()
    }
}

pub struct EntryCatalog {
    ledger: Arc<dyn LedgerClient>,
}

impl EntryCatalog {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    pub async fn refresh(&self) -> CatalogSnapshot {
        match self.ledger.list_entries().await {
            Ok(entries) if entries.is_empty() => {
                debug!("Catalog refresh returned no entries");
                CatalogSnapshot::Empty
            }
            Ok(entries) => {
                debug!(count = entries.len(), "Catalog refreshed");
                CatalogSnapshot::Entries(entries)
            }
            Err(e) => {
                warn!(error = %e, "Catalog refresh failed");
                CatalogSnapshot::Unavailable(e)
            }
        }
    }
}
