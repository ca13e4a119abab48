//! Reservation Coordinator - the lock/swap/broadcast choreography
//!
//! The competitor synchronises with us through nothing but the ledger's lock
//! flags, so the order of lock calls is the whole protocol:
//!
//! 1. lock the target alone and give the competitor time to notice;
//! 2. lock every other visible entry, re-listing until nothing is left, and
//!    only then unlock the target, so there is no instant where the target
//!    and anything else are both visible;
//! 3. broadcast one k-output spend, which can only pick the target;
//! 4. unlock the others right after the broadcast returns.
//!
//! Destinations are fetched during the isolation delay. Between the first
//! non-target lock and its release the only ledger calls are listings, the
//! target unlock and the broadcast.
//!
//! The rejected alternative is to unlock everything and re-lock the others.
//! That exposes every entry, target included, for the gap between the two
//! calls, and the competitor or the wallet's coin selection can take
//! anything during it. Nothing here ever unlocks in bulk mid-round.
//!
//! Every failure path runs `recover`: unlock all, consumer on.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use spreader_ledger::LedgerClient;
use spreader_types::{Destination, Entry, EntryId, ReservationState, Result, SpreaderError, TxId};

use crate::scheduler::ScheduleConfig;
use crate::SpreadPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorPhase {
    Idle,
    Isolating,
    Swapping,
    Broadcasting,
    Settling,
    Failed,
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Isolating => "isolating",
            Self::Swapping => "swapping",
            Self::Broadcasting => "broadcasting",
            Self::Settling => "settling",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// What a successful swap did
#[derive(Debug, Clone)]
pub struct SwapReport {
    pub target: Entry,
    pub txid: TxId,
    pub outputs: Vec<(Destination, Decimal)>,
    /// Non-target entries that were hidden for the broadcast
    pub excluded: usize,
    /// The ledger still listed the spent target after the broadcast; it was
    /// locked again
    pub stale_target: bool,
}

#[derive(Debug, Clone)]
pub enum SwapResult {
    Broadcast(SwapReport),
    BroadcastFailed,
    Failed {
        phase: CoordinatorPhase,
        error: SpreaderError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    Settled { height: u64 },
    TimedOut { last_height: Option<u64> },
}

/// Unlock every entry and switch the consumer back on.
///
/// The consumer is re-enabled even when the unlock fails.
pub async fn restore_all(ledger: &dyn LedgerClient) -> Result<()> {
    let unlocked = ledger.set_all_visible(true).await;
    ledger.set_background_consumer_enabled(true).await;
    unlocked
}

/// Lock-and-relist passes tolerated before new entries count as a fault
const MAX_EXCLUSION_PASSES: usize = 5;

pub struct ReservationCoordinator {
    ledger: Arc<dyn LedgerClient>,
    policy: SpreadPolicy,
    isolation_delay: Duration,
    settlement_poll: Duration,
    settlement_budget: Duration,
    phase: CoordinatorPhase,
    reservations: HashMap<EntryId, ReservationState>,
}

impl ReservationCoordinator {
    pub fn new(ledger: Arc<dyn LedgerClient>, policy: SpreadPolicy, schedule: &ScheduleConfig) -> Self {
        Self {
            ledger,
            policy,
            isolation_delay: schedule.isolation_delay(),
            settlement_poll: schedule.settlement_poll(),
            settlement_budget: schedule.settlement_budget(),
            phase: CoordinatorPhase::Idle,
            reservations: HashMap::new(),
        }
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    pub fn reservation(&self, id: &EntryId) -> ReservationState {
        self.reservations.get(id).copied().unwrap_or_default()
    }

    /// Entries this coordinator currently holds away from the competitor
    pub fn held_entries(&self) -> Vec<EntryId> {
        let mut held: Vec<EntryId> = self
            .reservations
            .iter()
            .filter(|(_, state)| **state != ReservationState::Free)
            .map(|(id, _)| id.clone())
            .collect();
        held.sort();
        held
    }

    fn transition(&mut self, next: CoordinatorPhase) {
        debug!(from = %self.phase, to = %next, "Coordinator phase change");
        self.phase = next;
    }

    fn mark(&mut self, ids: &[EntryId], state: ReservationState) {
        for id in ids {
            if state == ReservationState::Free {
                self.reservations.remove(id);
            } else {
                self.reservations.insert(id.clone(), state);
            }
        }
    }

    /// Run one isolate → swap → broadcast → restore pass for `target`.
    pub async fn execute(&mut self, target: &Entry) -> SwapResult {
        // Whatever the last round left marked has been unlocked by the caller
        self.reservations.clear();
        match self.swap(target).await {
            Ok(Some(report)) => {
                self.transition(CoordinatorPhase::Idle);
                SwapResult::Broadcast(report)
            }
            Ok(None) => {
                self.recover().await;
                SwapResult::BroadcastFailed
            }
            Err(error) => {
                let phase = self.phase;
                error!(
                    phase = %phase,
                    entry = %target.id,
                    code = error.error_code(),
                    error = %error,
                    "Swap aborted"
                );
                self.recover().await;
                SwapResult::Failed { phase, error }
            }
        }
    }

    async fn swap(&mut self, target: &Entry) -> Result<Option<SwapReport>> {
        let target_id = std::slice::from_ref(&target.id);

        // Isolating: only the target disappears, the rest stays as it was
        self.transition(CoordinatorPhase::Isolating);
        let amounts = self.policy.split_amounts(target.amount)?;
        self.ledger.set_visible(target_id, false).await?;
        let isolated_at = Instant::now();
        self.mark(target_id, ReservationState::ReservedForSpend);
        info!(entry = %target.id, delay_secs = self.isolation_delay.as_secs(), "Target isolated");

        let mut outputs = Vec::with_capacity(amounts.len());
        for amount in amounts {
            outputs.push((self.ledger.new_destination().await?, amount));
        }
        tokio::time::sleep(self.isolation_delay.saturating_sub(isolated_at.elapsed())).await;

        let listed = self.ledger.list_entries().await?;
        if listed.iter().any(|e| e.id == target.id) {
            return Err(SpreaderError::invariant(
                "isolation",
                &target.id,
                "target still listed as visible after lock",
            ));
        }

        // Swapping: hide everything else before the target comes back
        self.transition(CoordinatorPhase::Swapping);
        let mut others = Vec::new();
        self.exclude_others(target, listed.into_iter().map(|e| e.id).collect(), &mut others)
            .await?;
        self.release_target(target, &mut others).await?;
        info!(entry = %target.id, excluded = others.len(), "Target is the only visible entry");

        // Broadcasting
        self.transition(CoordinatorPhase::Broadcasting);
        let txid = match self.ledger.broadcast_fan_out(&outputs).await {
            Ok(Some(txid)) => txid,
            Ok(None) => {
                warn!(entry = %target.id, "Broadcast returned no transaction id");
                return Ok(None);
            }
            Err(e) => {
                warn!(entry = %target.id, error = %e, "Broadcast call failed");
                return Ok(None);
            }
        };
        info!(entry = %target.id, txid = %txid, outputs = outputs.len(), "Fan-out broadcast");

        let stale_target = self.restore_after_broadcast(target, &others).await;

        Ok(Some(SwapReport {
            target: target.clone(),
            txid,
            outputs,
            excluded: others.len(),
            stale_target,
        }))
    }

    /// Lock `batch`, then keep re-listing and locking whatever shows up until
    /// the listing is empty. The target stays locked throughout.
    async fn exclude_others(
        &mut self,
        target: &Entry,
        mut batch: Vec<EntryId>,
        others: &mut Vec<EntryId>,
    ) -> Result<()> {
        let mut passes = 0;
        while !batch.is_empty() {
            if passes == MAX_EXCLUSION_PASSES {
                return Err(SpreaderError::invariant(
                    "exclusion",
                    &target.id,
                    format!("entries still appearing after {} lock passes", passes),
                ));
            }
            passes += 1;

            self.ledger.set_visible(&batch, false).await?;
            self.mark(&batch, ReservationState::ExcludedFromCompetitor);
            others.append(&mut batch);

            let listed = self.ledger.list_entries().await?;
            if listed.iter().any(|e| e.id == target.id) {
                return Err(SpreaderError::invariant(
                    "exclusion",
                    &target.id,
                    "locked target listed as visible",
                ));
            }
            batch = listed.into_iter().map(|e| e.id).collect();
            if !batch.is_empty() {
                warn!(count = batch.len(), "Entries appeared mid-swap, excluding them");
            }
        }
        Ok(())
    }

    /// Unlock the target and confirm it is alone. Anything that slipped in
    /// since the last listing is excluded with the target locked again.
    async fn release_target(&mut self, target: &Entry, others: &mut Vec<EntryId>) -> Result<()> {
        let target_id = std::slice::from_ref(&target.id);
        for _ in 0..MAX_EXCLUSION_PASSES {
            self.ledger.set_visible(target_id, true).await?;

            let visible = self.ledger.list_entries().await?;
            if !visible.iter().any(|e| e.id == target.id) {
                return Err(SpreaderError::TargetVanished {
                    entry: target.id.to_string(),
                });
            }
            let stragglers: Vec<EntryId> = visible
                .into_iter()
                .map(|e| e.id)
                .filter(|id| id != &target.id)
                .collect();
            if stragglers.is_empty() {
                return Ok(());
            }

            warn!(count = stragglers.len(), "Entries appeared beside the target, locking it again");
            self.ledger.set_visible(target_id, false).await?;
            self.exclude_others(target, stragglers, others).await?;
        }
        Err(SpreaderError::invariant(
            "swapping",
            &target.id,
            "target never became the only visible entry",
        ))
    }

    /// Hand the non-target entries back. Returns whether the spent target
    /// was still listed and had to be hidden again.
    async fn restore_after_broadcast(&mut self, target: &Entry, others: &[EntryId]) -> bool {
        match self.ledger.set_visible(others, true).await {
            Ok(()) => self.mark(others, ReservationState::Free),
            Err(e) => {
                warn!(error = %e, "Selective restore failed, unlocking everything");
                self.recover().await;
            }
        }
        self.ledger.set_background_consumer_enabled(true).await;

        let target_id = std::slice::from_ref(&target.id);
        match self.ledger.list_entries().await {
            Ok(listed) if listed.iter().any(|e| e.id == target.id) => {
                match self.ledger.set_visible(target_id, false).await {
                    Ok(()) => {
                        self.mark(target_id, ReservationState::ReservedForSpend);
                        info!(entry = %target.id, "Spent target still listed, keeping it hidden");
                    }
                    Err(e) => warn!(entry = %target.id, error = %e, "Could not hide stale target"),
                }
                true
            }
            Ok(_) => {
                self.mark(target_id, ReservationState::Free);
                false
            }
            Err(e) => {
                warn!(error = %e, "Post-broadcast listing failed");
                self.mark(target_id, ReservationState::Free);
                false
            }
        }
    }

    /// Unconditional safety net: every entry visible, consumer on.
    ///
    /// Safe to call when nothing is locked.
    pub async fn recover(&mut self) {
        self.transition(CoordinatorPhase::Failed);
        if let Err(e) = restore_all(self.ledger.as_ref()).await {
            error!(error = %e, "Full visibility restore failed");
        }
        self.reservations.clear();
        self.transition(CoordinatorPhase::Idle);
    }

    /// Wait for the chain to move past `start_height`.
    ///
    /// Pacing only: running out of budget is reported, never treated as a
    /// failed round.
    pub async fn wait_for_settlement(&mut self, start_height: u64) -> SettlementStatus {
        self.transition(CoordinatorPhase::Settling);
        let deadline = Instant::now() + self.settlement_budget;
        let mut last_height = None;

        let status = loop {
            match self.ledger.current_height().await {
                Ok(height) if height > start_height => break SettlementStatus::Settled { height },
                Ok(height) => last_height = Some(height),
                Err(e) => debug!(error = %e, "Height poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                break SettlementStatus::TimedOut { last_height };
            }
            tokio::time::sleep(self.settlement_poll.min(deadline - now)).await;
        };

        match status {
            SettlementStatus::Settled { height } => info!(height, "Block mined, round settled"),
            SettlementStatus::TimedOut { last_height } => {
                warn!(start_height, ?last_height, "No new block within settlement budget")
            }
        }
        self.transition(CoordinatorPhase::Idle);
        status
    }
}
