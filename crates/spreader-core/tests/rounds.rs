//! End-to-end rounds against the in-memory ledger

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use spreader_core::{RoundScheduler, ScheduleConfig, SpreadPolicy};
use spreader_ledger::{Competitor, InMemoryLedger, LedgerClient, LedgerEvent};
use spreader_types::{Destination, Entry, EntryId, Result, RoundOutcome, SpreaderError, TxId};

fn entry(txid: &str, amount: Decimal, conf: u32) -> Entry {
    Entry::new(EntryId::new(txid, 0), amount, conf)
}

/// M = 5, T = 1000 × 5 + 2 = 5002
fn policy() -> SpreadPolicy {
    SpreadPolicy {
        fee_buffer: dec!(2),
        min_confirmations: 5,
        ..SpreadPolicy::new(dec!(1000))
    }
}

fn schedule() -> ScheduleConfig {
    ScheduleConfig {
        isolation_delay_secs: 5,
        settlement_poll_secs: 5,
        settlement_budget_secs: 60,
        empty_backoff_secs: 60,
        transient_backoff_secs: 10,
        failure_cooldown_secs: 15,
        catalog_retry_ceiling: 3,
    }
}

fn scheduler(ledger: Arc<dyn LedgerClient>, rounds: u32) -> RoundScheduler {
    RoundScheduler::new(ledger, policy(), schedule(), rounds).unwrap()
}

fn broadcast_inputs(journal: &[LedgerEvent]) -> Vec<Vec<EntryId>> {
    journal
        .iter()
        .filter_map(|event| match event {
            LedgerEvent::Broadcast { inputs, txid: Some(_) } => Some(inputs.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn big_entry_is_spread_and_small_one_survives() {
    let big = entry("big", dec!(5010), 6);
    let small = entry("small", dec!(100), 10);
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![big.clone(), small.clone()]));
    ledger.set_auto_mine(true).await;

    let mut scheduler = scheduler(ledger.clone(), 1);
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.transactions.len(), 1);
    assert!(!summary.interrupted);

    let journal = ledger.journal().await;
    assert_eq!(broadcast_inputs(&journal), vec![vec![big.id.clone()]]);

    let hidden = journal
        .iter()
        .position(|e| *e == LedgerEvent::SetVisible { ids: vec![small.id.clone()], visible: false })
        .unwrap();
    let restored = journal
        .iter()
        .position(|e| *e == LedgerEvent::SetVisible { ids: vec![small.id.clone()], visible: true })
        .unwrap();
    let broadcast = journal
        .iter()
        .position(|e| matches!(e, LedgerEvent::Broadcast { .. }))
        .unwrap();
    assert!(hidden < broadcast && broadcast < restored);

    assert!(ledger.contains(&small.id).await);
    assert!(ledger.locked_ids().await.is_empty());

    let outputs: Vec<Entry> = ledger
        .all_entries()
        .await
        .into_iter()
        .filter(|e| e.address.is_some())
        .collect();
    assert_eq!(outputs.len(), 5);
    assert!(outputs.iter().all(|e| e.amount == dec!(1001.6)));
}

#[tokio::test(start_paused = true)]
async fn empty_catalog_stalls_without_consuming_a_round() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut scheduler = scheduler(ledger.clone(), 1);

    let began = tokio::time::Instant::now();
    let outcome = scheduler.step().await.unwrap();

    assert_eq!(outcome, RoundOutcome::NoEligibleEntry);
    assert_eq!(scheduler.round_index(), 1);
    assert!(began.elapsed() >= Duration::from_secs(60));
    assert!(ledger
        .journal()
        .await
        .contains(&LedgerEvent::ConsumerEnabled(true)));
}

#[tokio::test(start_paused = true)]
async fn immature_entry_is_not_selected() {
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![entry("young", dec!(9000), 2)]));
    let mut scheduler = scheduler(ledger.clone(), 1);

    assert_eq!(scheduler.step().await.unwrap(), RoundOutcome::NoEligibleEntry);
    ledger.mine_blocks(3).await;
    assert!(scheduler.step().await.unwrap().is_success());
    assert!(scheduler.is_finished());
}

#[tokio::test(start_paused = true)]
async fn failed_broadcast_retries_the_same_round() {
    let big = entry("big", dec!(5010), 6);
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![big.clone(), entry("small", dec!(100), 10)]));
    ledger.fail_next_broadcasts(1).await;
    let mut scheduler = scheduler(ledger.clone(), 1);

    assert_eq!(scheduler.step().await.unwrap(), RoundOutcome::BroadcastFailed);
    assert_eq!(scheduler.round_index(), 1);
    assert!(ledger.locked_ids().await.is_empty());
    assert!(ledger.consumer_enabled().await);
    assert!(ledger.contains(&big.id).await);

    assert!(scheduler.step().await.unwrap().is_success());
    assert_eq!(scheduler.round_index(), 2);
    assert_eq!(scheduler.summary().failures, 1);
    assert_eq!(scheduler.summary().attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn stolen_target_is_never_broadcast() {
    let big = entry("big", dec!(5010), 6);
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![big.clone(), entry("small", dec!(100), 10)]));
    ledger.steal_on_unlock(big.id.clone()).await;
    let mut scheduler = scheduler(ledger.clone(), 1);

    let outcome = scheduler.step().await.unwrap();
    assert!(matches!(outcome, RoundOutcome::Error { ref step, .. } if step == "swapping"));
    assert_eq!(scheduler.round_index(), 1);
    assert!(broadcast_inputs(&ledger.journal().await).is_empty());
    assert!(ledger.locked_ids().await.is_empty());
    assert_eq!(ledger.competitor_spent().await, vec![big.id]);
}

#[tokio::test(start_paused = true)]
async fn budget_of_n_rounds_terminates_after_n_successes() {
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![
        entry("a", dec!(5010), 6),
        entry("b", dec!(5020), 6),
        entry("c", dec!(5030), 6),
        entry("d", dec!(5040), 6),
    ]));
    ledger.set_auto_mine(true).await;

    let mut scheduler = scheduler(ledger.clone(), 3);
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(summary.attempts, 3);
    assert_eq!(scheduler.round_index(), 4);
    // Biggest first
    let spent: Vec<Vec<EntryId>> = broadcast_inputs(&ledger.journal().await);
    assert_eq!(
        spent,
        vec![
            vec![EntryId::new("d", 0)],
            vec![EntryId::new("c", 0)],
            vec![EntryId::new("b", 0)],
        ]
    );
    assert!(ledger.contains(&EntryId::new("a", 0)).await);
}

#[tokio::test(start_paused = true)]
async fn stall_before_the_last_round_does_not_end_the_run() {
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![entry("a", dec!(5010), 6)]));
    ledger.set_auto_mine(true).await;
    let mut scheduler = scheduler(ledger.clone(), 2);

    assert!(scheduler.step().await.unwrap().is_success());
    assert_eq!(scheduler.step().await.unwrap(), RoundOutcome::NoEligibleEntry);
    assert!(!scheduler.is_finished());
    assert_eq!(scheduler.summary().completed, 1);
    assert_eq!(scheduler.summary().stalls, 1);

    ledger.deposit(entry("late", dec!(6000), 8)).await;
    assert!(scheduler.step().await.unwrap().is_success());
    assert!(scheduler.is_finished());
    assert_eq!(scheduler.summary().completed, 2);
}

#[tokio::test(start_paused = true)]
async fn run_waits_out_stalls_until_funds_arrive() {
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![entry("a", dec!(5010), 6)]));
    ledger.set_auto_mine(true).await;

    let depositor = ledger.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        depositor.deposit(entry("late", dec!(6000), 8)).await;
    });

    let mut scheduler = scheduler(ledger.clone(), 2);
    let summary = tokio::time::timeout(Duration::from_secs(3600), scheduler.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert!(summary.stalls >= 1);
}

#[tokio::test(start_paused = true)]
async fn competitor_never_takes_a_target() {
    let mut entries: Vec<Entry> = (0..6).map(|i| entry(&format!("small-{}", i), dec!(100), 10)).collect();
    entries.extend([
        entry("big-1", dec!(5010), 6),
        entry("big-2", dec!(5020), 6),
        entry("big-3", dec!(5030), 6),
        entry("big-4", dec!(5040), 6),
    ]);
    let ledger = Arc::new(InMemoryLedger::with_entries(entries));
    ledger.set_auto_mine(true).await;
    let competitor = Competitor::new(ledger.clone(), Duration::from_secs(3)).spawn();

    let mut scheduler = scheduler(ledger.clone(), 3);
    let summary = tokio::time::timeout(Duration::from_secs(3600), scheduler.run())
        .await
        .unwrap()
        .unwrap();
    competitor.stop();

    assert_eq!(summary.completed, 3);
    assert!(!ledger.competitor_spent().await.is_empty());

    let targets: Vec<EntryId> = scheduler
        .history()
        .iter()
        .filter(|round| round.outcome.is_success())
        .filter_map(|round| round.target.as_ref().map(|t| t.id.clone()))
        .collect();
    let spent_by_us = broadcast_inputs(&ledger.journal().await);
    assert_eq!(spent_by_us.len(), 3);
    for (inputs, target) in spent_by_us.iter().zip(&targets) {
        assert_eq!(inputs, &vec![target.clone()]);
    }

    let stolen = ledger.competitor_spent().await;
    assert!(targets.iter().all(|t| !stolen.contains(t)));
    assert!(ledger.locked_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreadable_catalog_is_fatal_after_the_ceiling() {
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![entry("a", dec!(5010), 6)]));
    ledger.fail_next_lists(100).await;

    let mut scheduler = scheduler(ledger.clone(), 1);
    let result = scheduler.run().await;

    assert!(matches!(result, Err(SpreaderError::CatalogUnavailable { attempts: 3 })));
    assert_eq!(scheduler.summary().attempts, 3);
    assert!(ledger.locked_ids().await.is_empty());
    assert!(ledger.consumer_enabled().await);
}

#[tokio::test(start_paused = true)]
async fn interrupt_mid_isolation_restores_everything() {
    let big = entry("big", dec!(5010), 6);
    let ledger = Arc::new(InMemoryLedger::with_entries(vec![big.clone(), entry("small", dec!(100), 10)]));

    let mut scheduler = scheduler(ledger.clone(), 1);
    let summary = scheduler
        .run_until(tokio::time::sleep(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.completed, 0);
    assert!(ledger.locked_ids().await.is_empty());
    let journal = ledger.journal().await;
    assert!(journal.contains(&LedgerEvent::SetVisible { ids: vec![big.id], visible: false }));
    assert_eq!(
        &journal[journal.len() - 2..],
        &[LedgerEvent::SetAllVisible(true), LedgerEvent::ConsumerEnabled(true)]
    );
}

/// Keeps reporting the last spent input for a while, as a lagging wallet
/// index would
struct LaggingLedger {
    inner: InMemoryLedger,
    ghost: Mutex<Option<Ghost>>,
}

struct Ghost {
    entry: Entry,
    locked: bool,
    remaining: u32,
}

impl LaggingLedger {
    fn new(entries: Vec<Entry>) -> Self {
        Self {
            inner: InMemoryLedger::with_entries(entries),
            ghost: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LedgerClient for LaggingLedger {
    async fn list_entries(&self) -> Result<Vec<Entry>> {
        let mut entries = self.inner.list_entries().await?;
        if let Some(ghost) = self.ghost.lock().await.as_mut() {
            if !ghost.locked && ghost.remaining > 0 {
                ghost.remaining -= 1;
                entries.insert(0, ghost.entry.clone());
            }
        }
        Ok(entries)
    }

    async fn current_height(&self) -> Result<u64> {
        self.inner.current_height().await
    }

    async fn set_all_visible(&self, visible: bool) -> Result<()> {
        if let Some(ghost) = self.ghost.lock().await.as_mut() {
            ghost.locked = !visible;
        }
        self.inner.set_all_visible(visible).await
    }

    async fn set_visible(&self, entries: &[EntryId], visible: bool) -> Result<()> {
        let mut real = entries.to_vec();
        if let Some(ghost) = self.ghost.lock().await.as_mut() {
            if entries.contains(&ghost.entry.id) {
                ghost.locked = !visible;
                real.retain(|id| id != &ghost.entry.id);
            }
        }
        self.inner.set_visible(&real, visible).await
    }

    async fn new_destination(&self) -> Result<Destination> {
        self.inner.new_destination().await
    }

    async fn broadcast_fan_out(&self, outputs: &[(Destination, Decimal)]) -> Result<Option<TxId>> {
        let before = self.inner.all_entries().await;
        let txid = self.inner.broadcast_fan_out(outputs).await?;
        if txid.is_some() {
            let after = self.inner.all_entries().await;
            if let Some(spent) = before.into_iter().find(|e| !after.iter().any(|a| a.id == e.id)) {
                *self.ghost.lock().await = Some(Ghost {
                    entry: spent,
                    locked: false,
                    remaining: 10,
                });
            }
        }
        Ok(txid)
    }

    async fn set_background_consumer_enabled(&self, enabled: bool) {
        self.inner.set_background_consumer_enabled(enabled).await
    }
}

#[tokio::test(start_paused = true)]
async fn spent_target_is_not_selected_again_while_still_listed() {
    let first = entry("first", dec!(5010), 6);
    let second = entry("second", dec!(5005), 6);
    let ledger = Arc::new(LaggingLedger::new(vec![first.clone(), second.clone()]));
    ledger.inner.set_auto_mine(true).await;

    let mut scheduler = scheduler(ledger.clone(), 2);
    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.completed, 2);

    let targets: Vec<EntryId> = scheduler
        .history()
        .iter()
        .filter_map(|round| round.target.as_ref().map(|t| t.id.clone()))
        .collect();
    assert_eq!(targets, vec![first.id.clone(), second.id.clone()]);

    let spent = broadcast_inputs(&ledger.inner.journal().await);
    assert_eq!(spent, vec![vec![first.id], vec![second.id]]);
}

/// A wallet without keys: it can list and lock, but never hands out an address
struct KeylessLedger(InMemoryLedger);

#[async_trait]
impl LedgerClient for KeylessLedger {
    async fn list_entries(&self) -> Result<Vec<Entry>> {
        self.0.list_entries().await
    }

    async fn current_height(&self) -> Result<u64> {
        self.0.current_height().await
    }

    async fn set_all_visible(&self, visible: bool) -> Result<()> {
        self.0.set_all_visible(visible).await
    }

    async fn set_visible(&self, entries: &[EntryId], visible: bool) -> Result<()> {
        self.0.set_visible(entries, visible).await
    }

    async fn new_destination(&self) -> Result<Destination> {
        Err(SpreaderError::invalid_policy("wallet has no keys to derive destinations from"))
    }

    async fn broadcast_fan_out(&self, outputs: &[(Destination, Decimal)]) -> Result<Option<TxId>> {
        self.0.broadcast_fan_out(outputs).await
    }

    async fn set_background_consumer_enabled(&self, enabled: bool) {
        self.0.set_background_consumer_enabled(enabled).await
    }
}

#[tokio::test(start_paused = true)]
async fn non_retriable_swap_error_ends_the_run() {
    let ledger = Arc::new(KeylessLedger(InMemoryLedger::with_entries(vec![
        entry("big", dec!(5010), 6),
        entry("small", dec!(100), 10),
    ])));

    let mut scheduler = scheduler(ledger.clone(), 3);
    let result = scheduler.run().await;

    assert!(matches!(result, Err(SpreaderError::InvalidPolicy { .. })));
    assert_eq!(scheduler.summary().attempts, 1);
    assert!(broadcast_inputs(&ledger.0.journal().await).is_empty());
    assert!(ledger.0.locked_ids().await.is_empty());
    assert!(ledger.0.consumer_enabled().await);
}
