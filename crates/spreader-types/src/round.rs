//! Rounds and round outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Entry, TxId};

/// How a single round attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundOutcome {
    /// Target fanned out in one transaction
    Succeeded { txid: TxId },
    /// Catalog listed nothing that meets the policy
    NoEligibleEntry,
    /// Catalog could not be read at all
    CatalogUnavailable,
    /// Broadcast returned no transaction identity
    BroadcastFailed,
    /// Any other failure; visibility was restored
    Error { step: String, reason: String },
}

impl RoundOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { txid } => write!(f, "succeeded ({})", txid),
            Self::NoEligibleEntry => write!(f, "no eligible entry"),
            Self::CatalogUnavailable => write!(f, "catalog unavailable"),
            Self::BroadcastFailed => write!(f, "broadcast failed"),
            Self::Error { step, reason } => write!(f, "error in {}: {}", step, reason),
        }
    }
}

/// One attempt at round `sequence`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub sequence: u32,
    pub target: Option<Entry>,
    pub outcome: RoundOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Round {
    pub fn new(
        sequence: u32,
        target: Option<Entry>,
        outcome: RoundOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence,
            target,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
