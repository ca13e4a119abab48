//! Round Scheduler
//!
//! Drives rounds `1..=N`. The round index only moves on a successful
//! broadcast; stalls and failures retry the same index after a backoff.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use spreader_ledger::LedgerClient;
use spreader_types::{Entry, EntryId, Result, Round, RoundOutcome, SpreaderError, TxId};

use crate::catalog::{CatalogSnapshot, EntryCatalog};
use crate::coordinator::{ReservationCoordinator, SwapResult};
use crate::policy::SpreadPolicy;
use crate::selector::select_target;

/// Timing knobs, all in whole seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Must exceed the competitor's own refresh interval
    #[serde(default = "default_isolation_delay")]
    pub isolation_delay_secs: u64,
    #[serde(default = "default_settlement_poll")]
    pub settlement_poll_secs: u64,
    #[serde(default = "default_settlement_budget")]
    pub settlement_budget_secs: u64,
    /// Wait after a round found nothing to spend
    #[serde(default = "default_empty_backoff")]
    pub empty_backoff_secs: u64,
    /// Wait after the catalog could not be read
    #[serde(default = "default_transient_backoff")]
    pub transient_backoff_secs: u64,
    /// Wait after a failed broadcast or an aborted swap
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown_secs: u64,
    /// Consecutive catalog failures tolerated before the run gives up
    #[serde(default = "default_catalog_retry_ceiling")]
    pub catalog_retry_ceiling: u32,
}

fn default_isolation_delay() -> u64 {
    5
}

fn default_settlement_poll() -> u64 {
    5
}

fn default_settlement_budget() -> u64 {
    600
}

fn default_empty_backoff() -> u64 {
    60
}

fn default_transient_backoff() -> u64 {
    10
}

fn default_failure_cooldown() -> u64 {
    15
}

fn default_catalog_retry_ceiling() -> u32 {
    10
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            isolation_delay_secs: default_isolation_delay(),
            settlement_poll_secs: default_settlement_poll(),
            settlement_budget_secs: default_settlement_budget(),
            empty_backoff_secs: default_empty_backoff(),
            transient_backoff_secs: default_transient_backoff(),
            failure_cooldown_secs: default_failure_cooldown(),
            catalog_retry_ceiling: default_catalog_retry_ceiling(),
        }
    }
}

impl ScheduleConfig {
    pub fn isolation_delay(&self) -> Duration {
        Duration::from_secs(self.isolation_delay_secs)
    }

    pub fn settlement_poll(&self) -> Duration {
        Duration::from_secs(self.settlement_poll_secs)
    }

    pub fn settlement_budget(&self) -> Duration {
        Duration::from_secs(self.settlement_budget_secs)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_secs(self.empty_backoff_secs)
    }

    pub fn transient_backoff(&self) -> Duration {
        Duration::from_secs(self.transient_backoff_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}

/// Totals for one `run`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub requested: u32,
    pub completed: u32,
    pub attempts: u32,
    /// Rounds that found nothing eligible
    pub stalls: u32,
    /// Failed broadcasts and aborted swaps
    pub failures: u32,
    pub transactions: Vec<TxId>,
    pub interrupted: bool,
}

struct Attempt {
    target: Option<Entry>,
    outcome: RoundOutcome,
    start_height: Option<u64>,
}

pub struct RoundScheduler {
    ledger: Arc<dyn LedgerClient>,
    catalog: EntryCatalog,
    coordinator: ReservationCoordinator,
    policy: SpreadPolicy,
    schedule: ScheduleConfig,
    rounds: u32,
    round_index: u32,
    catalog_failures: u32,
    last_height: Option<u64>,
    /// Spent targets the ledger may still report
    pending_spent: HashSet<EntryId>,
    history: Vec<Round>,
    summary: RunSummary,
}

impl RoundScheduler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        policy: SpreadPolicy,
        schedule: ScheduleConfig,
        rounds: u32,
    ) -> Result<Self> {
        policy.validate()?;
        if rounds == 0 {
            return Err(SpreaderError::invalid_policy("round budget must be at least 1"));
        }

        Ok(Self {
            catalog: EntryCatalog::new(ledger.clone()),
            coordinator: ReservationCoordinator::new(ledger.clone(), policy.clone(), &schedule),
            ledger,
            policy,
            schedule,
            rounds,
            round_index: 1,
            catalog_failures: 0,
            last_height: None,
            pending_spent: HashSet::new(),
            history: Vec::new(),
            summary: RunSummary {
                requested: rounds,
                ..RunSummary::default()
            },
        })
    }

    /// The next round to run, 1-based
    pub fn round_index(&self) -> u32 {
        self.round_index
    }

    pub fn is_finished(&self) -> bool {
        self.round_index > self.rounds
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Every attempt so far, including stalls and failures
    pub fn history(&self) -> &[Round] {
        &self.history
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until the budget is spent or `shutdown` resolves.
    ///
    /// Interruption and fatal errors both end in the coordinator's recovery
    /// path before returning.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let finished = tokio::select! {
            result = self.drive() => Some(result),
            _ = shutdown => None,
        };

        match finished {
            Some(Ok(())) => Ok(self.summary.clone()),
            Some(Err(e)) => {
                error!(code = e.error_code(), error = %e, "Run aborted");
                self.coordinator.recover().await;
                Err(e)
            }
            None => {
                warn!(round = self.round_index, "Interrupted, restoring visibility");
                self.coordinator.recover().await;
                self.summary.interrupted = true;
                Ok(self.summary.clone())
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.report_start().await;
        while !self.is_finished() {
            self.step().await?;
        }
        info!(
            completed = self.summary.completed,
            attempts = self.summary.attempts,
            "All rounds completed"
        );
        Ok(())
    }

    async fn report_start(&mut self) {
        let height = self.ledger.current_height().await.ok();
        if height.is_some() {
            self.last_height = height;
        }
        info!(
            amount_per_split = %self.policy.amount_per_split,
            fan_out = self.policy.fan_out_width,
            threshold = %self.policy.threshold(),
            min_confirmations = self.policy.min_confirmations,
            mode = %self.policy.mode,
            rounds = self.rounds,
            height = ?height,
            "Starting stake spreader"
        );
    }

    /// One attempt at the current round index, followed by its backoff or
    /// settlement wait. Only a repeatedly unreadable catalog or a swap error
    /// that retrying cannot fix is returned as `Err`.
    pub async fn step(&mut self) -> Result<RoundOutcome> {
        let sequence = self.round_index;
        let started_at = Utc::now();
        self.summary.attempts += 1;

        let span = info_span!("round", round = sequence, of = self.rounds);
        let attempt = self.attempt().instrument(span.clone()).await?;
        info!(parent: &span, outcome = %attempt.outcome, "Round finished");

        self.history.push(Round::new(
            sequence,
            attempt.target,
            attempt.outcome.clone(),
            started_at,
        ));
        self.after_round(&attempt.outcome, attempt.start_height)
            .instrument(span)
            .await;
        Ok(attempt.outcome)
    }

    async fn attempt(&mut self) -> Result<Attempt> {
        // Ground truth first: nothing of ours should still be locked
        if let Err(e) = self.ledger.set_all_visible(true).await {
            warn!(error = %e, "Pre-round unlock failed");
        }

        let start_height = match self.ledger.current_height().await {
            Ok(height) => {
                self.last_height = Some(height);
                Some(height)
            }
            Err(e) => {
                warn!(error = %e, fallback = ?self.last_height, "Height unavailable");
                self.last_height
            }
        };

        let entries = match self.catalog.refresh().await {
            CatalogSnapshot::Unavailable(e) => {
                self.catalog_failures += 1;
                if self.catalog_failures >= self.schedule.catalog_retry_ceiling {
                    return Err(SpreaderError::CatalogUnavailable {
                        attempts: self.catalog_failures,
                    });
                }
                warn!(
                    failures = self.catalog_failures,
                    ceiling = self.schedule.catalog_retry_ceiling,
                    error = %e,
                    "Catalog unavailable"
                );
                return Ok(Attempt {
                    target: None,
                    outcome: RoundOutcome::CatalogUnavailable,
                    start_height,
                });
            }
            snapshot => {
                self.catalog_failures = 0;
                debug!(count = snapshot.entries().len(), total = %snapshot.total_value(), "Catalog");
                self.exclude_pending_spent(snapshot.entries()).await
            }
        };

        let Some(target) = select_target(&entries, &self.policy.selection()) else {
            info!(
                entries = entries.len(),
                threshold = %self.policy.threshold(),
                min_confirmations = self.policy.min_confirmations,
                "No eligible entry"
            );
            return Ok(Attempt {
                target: None,
                outcome: RoundOutcome::NoEligibleEntry,
                start_height,
            });
        };
        info!(entry = %target.id, amount = %target.amount, confirmations = target.confirmations, "Target selected");

        let outcome = match self.coordinator.execute(&target).await {
            SwapResult::Broadcast(report) => {
                self.pending_spent.insert(report.target.id.clone());
                RoundOutcome::Succeeded { txid: report.txid }
            }
            SwapResult::BroadcastFailed => RoundOutcome::BroadcastFailed,
            // Retrying cannot help; the coordinator has already restored visibility
            SwapResult::Failed { error, .. } if !error.is_retriable() => return Err(error),
            SwapResult::Failed { phase, error } => RoundOutcome::Error {
                step: phase.to_string(),
                reason: error.to_string(),
            },
        };

        Ok(Attempt {
            target: Some(target),
            outcome,
            start_height,
        })
    }

    /// Drop spent targets the ledger has forgotten, and keep the rest locked
    /// and out of selection.
    async fn exclude_pending_spent(&mut self, entries: &[Entry]) -> Vec<Entry> {
        self.pending_spent
            .retain(|id| entries.iter().any(|e| &e.id == id));
        if self.pending_spent.is_empty() {
            return entries.to_vec();
        }

        let stale: Vec<EntryId> = self.pending_spent.iter().cloned().collect();
        info!(count = stale.len(), "Spent entries still listed, keeping them hidden");
        if let Err(e) = self.ledger.set_visible(&stale, false).await {
            warn!(error = %e, "Could not hide spent entries");
        }
        entries
            .iter()
            .filter(|e| !self.pending_spent.contains(&e.id))
            .cloned()
            .collect()
    }

    async fn after_round(&mut self, outcome: &RoundOutcome, start_height: Option<u64>) {
        match outcome {
            RoundOutcome::Succeeded { txid } => {
                self.summary.completed += 1;
                self.summary.transactions.push(txid.clone());
                self.round_index += 1;
                if self.is_finished() {
                    return;
                }
                match start_height {
                    Some(height) => {
                        self.coordinator.wait_for_settlement(height).await;
                    }
                    None => tokio::time::sleep(self.schedule.settlement_poll()).await,
                }
            }
            RoundOutcome::NoEligibleEntry => {
                self.summary.stalls += 1;
                self.ledger.set_background_consumer_enabled(true).await;
                tokio::time::sleep(self.schedule.empty_backoff()).await;
            }
            RoundOutcome::CatalogUnavailable => {
                tokio::time::sleep(self.schedule.transient_backoff()).await;
            }
            RoundOutcome::BroadcastFailed | RoundOutcome::Error { .. } => {
                self.summary.failures += 1;
                tokio::time::sleep(self.schedule.failure_cooldown()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use spreader_ledger::InMemoryLedger;

    #[test]
    fn schedule_defaults() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.isolation_delay(), Duration::from_secs(5));
        assert_eq!(schedule.settlement_budget(), Duration::from_secs(600));
        assert_eq!(schedule.catalog_retry_ceiling, 10);
        assert!(schedule.empty_backoff() > schedule.transient_backoff());
    }

    #[test]
    fn partial_schedule_fills_defaults() {
        let schedule: ScheduleConfig = serde_json::from_str(r#"{"isolation_delay_secs": 8}"#).unwrap();
        assert_eq!(schedule.isolation_delay_secs, 8);
        assert_eq!(schedule.failure_cooldown_secs, 15);
    }

    #[test]
    fn zero_rounds_rejected() {
        let ledger = Arc::new(InMemoryLedger::new());
        let result = RoundScheduler::new(ledger, SpreadPolicy::new(dec!(10)), ScheduleConfig::default(), 0);
        assert!(matches!(result, Err(SpreaderError::InvalidPolicy { .. })));
    }

    #[test]
    fn invalid_policy_rejected() {
        let ledger = Arc::new(InMemoryLedger::new());
        let result = RoundScheduler::new(ledger, SpreadPolicy::new(dec!(0)), ScheduleConfig::default(), 1);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn catalog_failure_is_not_a_stall() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fail_next_lists(1).await;
        let mut scheduler =
            RoundScheduler::new(ledger, SpreadPolicy::new(dec!(10)), ScheduleConfig::default(), 1).unwrap();

        let outcome = scheduler.step().await.unwrap();
        assert_eq!(outcome, RoundOutcome::CatalogUnavailable);
        assert_eq!(scheduler.summary().stalls, 0);
        assert_eq!(scheduler.round_index(), 1);

        let outcome = scheduler.step().await.unwrap();
        assert_eq!(outcome, RoundOutcome::NoEligibleEntry);
        assert_eq!(scheduler.summary().stalls, 1);
        assert_eq!(scheduler.history().len(), 2);
    }
}
