//! Spreader Types - Data model for the stake spreader
//!
//! This crate holds the types shared by the ledger adapter, the coordinator
//! and the CLI:
//!
//! - Entry identity and snapshots (`EntryId`, `Entry`)
//! - Spend artefacts (`Destination`, `TxId`)
//! - Coordinator-side reservation state (`ReservationState`)
//! - Rounds and their outcomes (`Round`, `RoundOutcome`)
//! - The error taxonomy (`SpreaderError`)
//!
//! Entries are immutable snapshots. Nothing here talks to a ledger; the
//! reservation state is bookkeeping the coordinator derives from the
//! lock/unlock calls it has issued.

pub mod entry;
pub mod error;
pub mod round;

pub use entry::*;
pub use error::*;
pub use round::*;

/// Decimal places a ledger amount carries (one satoshi).
pub const AMOUNT_SCALE: u32 = 8;
