//! Ledger entries and spend artefacts

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::AMOUNT_SCALE;

/// Opaque reference to one spendable output: container id plus index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId {
    pub txid: String,
    pub vout: u32,
}

impl EntryId {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Snapshot of a spendable entry as the ledger reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    /// Amount held, never negative
    pub amount: Decimal,
    /// Confirmation depth at the time of the snapshot
    pub confirmations: u32,
    /// Receiving address, when the ledger reports one
    #[serde(default)]
    pub address: Option<String>,
}

impl Entry {
    pub fn new(id: EntryId, amount: Decimal, confirmations: u32) -> Self {
        Self {
            id,
            amount: amount.max(Decimal::ZERO),
            confirmations,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} @ {} conf)", self.id, self.amount, self.confirmations)
    }
}

/// Freshly generated receiving address for one fan-out output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination(pub String);

impl Destination {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordinator-side view of an entry during a round.
///
/// The ledger only knows locked/unlocked; who locked an entry and why lives
/// here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    /// Visible to the competitor
    #[default]
    Free,
    /// The round's target, held for the automation's own spend
    ReservedForSpend,
    /// A non-target entry hidden so the broadcast cannot pick it up
    ExcludedFromCompetitor,
}

/// Truncate an amount to ledger precision.
pub fn truncate_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero)
}
