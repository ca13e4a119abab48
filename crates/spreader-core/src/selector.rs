//! Target selection
//!
//! Biggest qualifying entry wins, so each round leaves the most value behind
//! for later rounds. Ties go to the entry listed first, which keeps selection
//! reproducible.

use spreader_types::Entry;

use crate::SelectionPolicy;

/// Pick the round's target, or `None` when nothing qualifies yet.
pub fn select_target(entries: &[Entry], policy: &SelectionPolicy) -> Option<Entry> {
    let mut best: Option<&Entry> = None;
    for entry in entries {
        if entry.confirmations < policy.min_confirmations || entry.amount < policy.min_amount {
            continue;
        }
        match best {
            Some(current) if entry.amount <= current.amount => {}
            _ => best = Some(entry),
        }
    }
    best.cloned()
}
