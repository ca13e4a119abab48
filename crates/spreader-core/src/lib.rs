//! Spreader Core - Exclusive custody of one ledger entry at a time
//!
//! A background competitor spends any entry it can see. This crate takes one
//! entry away from it just long enough to fan it out, and hands everything
//! else back as soon as the broadcast returns.
//!
//! # Round flow
//!
//! ```text
//! RoundScheduler
//!   │  unlock all (idempotent), record height
//!   ├── EntryCatalog::refresh ──► Unavailable | Empty | Entries
//!   ├── select_target          ──► biggest qualifying entry, first seen wins ties
//!   ├── ReservationCoordinator
//!   │     Isolating    lock target, wait out the competitor's refresh
//!   │     Swapping     lock every other entry, then unlock the target
//!   │     Broadcasting one k-output spend of the target
//!   │     restore      unlock the others, consumer on, re-hide a stale target
//!   └── Settling       poll height until it moves or the budget runs out
//! ```
//!
//! Any failure ends in the same recovery: every entry visible, consumer on.

pub mod catalog;
pub mod coordinator;
pub mod policy;
pub mod scheduler;
pub mod selector;

pub use catalog::{CatalogSnapshot, EntryCatalog};
pub use coordinator::{
    restore_all, CoordinatorPhase, ReservationCoordinator, SettlementStatus, SwapReport, SwapResult,
};
pub use policy::{FanOutMode, SelectionPolicy, SpreadPolicy};
pub use scheduler::{RoundScheduler, RunSummary, ScheduleConfig};
pub use selector::select_target;
