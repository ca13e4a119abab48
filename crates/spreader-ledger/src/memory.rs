//! InMemoryLedger - a wallet fake honouring the `LedgerClient` contract
//!
//! Entries keep insertion order, which is the catalog order `list_entries`
//! reports. Every coordinator call and every competitor spend is journaled so
//! tests can assert on ordering, and a snapshot of the visible set is taken
//! after each visibility change.
//!
//! The fake wallet picks broadcast inputs itself from whatever is visible,
//! largest first, the way a real wallet's coin selection would. That is what
//! makes the lock choreography observable.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use spreader_types::{Destination, Entry, EntryId, Result, SpreaderError, TxId};

use crate::LedgerClient;

/// Something that happened to the fake ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    ListEntries,
    CurrentHeight,
    SetAllVisible(bool),
    SetVisible { ids: Vec<EntryId>, visible: bool },
    NewDestination,
    Broadcast { inputs: Vec<EntryId>, txid: Option<TxId> },
    ConsumerEnabled(bool),
    /// The competitor spent a visible entry
    CompetitorConsumed(EntryId),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: Entry,
    locked: bool,
}

#[derive(Debug, Default)]
struct Faults {
    failing_lists: u32,
    failing_heights: u32,
    empty_broadcasts: u32,
    steal_on_unlock: Option<EntryId>,
    spend_before_lock: Option<EntryId>,
}

#[derive(Debug)]
struct LedgerState {
    entries: Vec<StoredEntry>,
    height: u64,
    consumer_enabled: bool,
    auto_mine: bool,
    fee: Decimal,
    stake_reward: Decimal,
    next_tx: u64,
    next_destination: u64,
    journal: Vec<LedgerEvent>,
    visibility_history: Vec<Vec<EntryId>>,
    faults: Faults,
}

impl LedgerState {
    fn visible_ids(&self) -> Vec<EntryId> {
        self.entries
            .iter()
            .filter(|s| !s.locked)
            .map(|s| s.entry.id.clone())
            .collect()
    }

    fn snapshot_visibility(&mut self) {
        let visible = self.visible_ids();
        self.visibility_history.push(visible);
    }

    fn mine(&mut self, blocks: u64) {
        self.height += blocks;
        let depth = blocks.min(u32::MAX as u64) as u32;
        for stored in &mut self.entries {
            stored.entry.confirmations = stored.entry.confirmations.saturating_add(depth);
        }
    }

    /// The competitor spends `id` outside its own timer
    fn consume(&mut self, id: &EntryId) {
        self.entries.retain(|s| &s.entry.id != id);
        self.journal.push(LedgerEvent::CompetitorConsumed(id.clone()));
    }

    fn next_txid(&mut self, prefix: &str) -> TxId {
        self.next_tx += 1;
        TxId::new(format!("{}-{:04}", prefix, self.next_tx))
    }
}

pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_entries(Vec::new())
    }

    pub fn with_entries(entries: Vec<Entry>) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                entries: entries
                    .into_iter()
                    .map(|entry| StoredEntry { entry, locked: false })
                    .collect(),
                height: 100,
                consumer_enabled: true,
                auto_mine: false,
                fee: Decimal::new(1, 3),
                stake_reward: Decimal::new(5, 0),
                next_tx: 0,
                next_destination: 0,
                journal: Vec::new(),
                visibility_history: Vec::new(),
                faults: Faults::default(),
            }),
        }
    }

    /// Mine a block after every successful broadcast
    pub async fn set_auto_mine(&self, enabled: bool) {
        self.state.write().await.auto_mine = enabled;
    }

    pub async fn deposit(&self, entry: Entry) {
        self.state.write().await.entries.push(StoredEntry { entry, locked: false });
    }

    pub async fn mine_blocks(&self, blocks: u64) {
        self.state.write().await.mine(blocks);
    }

    pub async fn fail_next_lists(&self, count: u32) {
        self.state.write().await.faults.failing_lists = count;
    }

    pub async fn fail_next_heights(&self, count: u32) {
        self.state.write().await.faults.failing_heights = count;
    }

    pub async fn fail_next_broadcasts(&self, count: u32) {
        self.state.write().await.faults.empty_broadcasts = count;
    }

    /// Have the competitor win the race for `id`: the moment it is unlocked,
    /// it is spent.
    pub async fn steal_on_unlock(&self, id: EntryId) {
        self.state.write().await.faults.steal_on_unlock = Some(id);
    }

    /// Have the competitor spend `id` just before a lock call naming it
    /// arrives, so the whole lock batch is rejected.
    pub async fn spend_before_lock(&self, id: EntryId) {
        self.state.write().await.faults.spend_before_lock = Some(id);
    }

    pub async fn journal(&self) -> Vec<LedgerEvent> {
        self.state.read().await.journal.clone()
    }

    pub async fn visibility_history(&self) -> Vec<Vec<EntryId>> {
        self.state.read().await.visibility_history.clone()
    }

    /// Every entry, locked or not, in catalog order
    pub async fn all_entries(&self) -> Vec<Entry> {
        self.state.read().await.entries.iter().map(|s| s.entry.clone()).collect()
    }

    pub async fn contains(&self, id: &EntryId) -> bool {
        self.state.read().await.entries.iter().any(|s| &s.entry.id == id)
    }

    pub async fn locked_ids(&self) -> Vec<EntryId> {
        self.state
            .read()
            .await
            .entries
            .iter()
            .filter(|s| s.locked)
            .map(|s| s.entry.id.clone())
            .collect()
    }

    pub async fn consumer_enabled(&self) -> bool {
        self.state.read().await.consumer_enabled
    }

    pub async fn height(&self) -> u64 {
        self.state.read().await.height
    }

    /// Entries the competitor has spent so far
    pub async fn competitor_spent(&self) -> Vec<EntryId> {
        self.state
            .read()
            .await
            .journal
            .iter()
            .filter_map(|event| match event {
                LedgerEvent::CompetitorConsumed(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// One competitor turn: spend the first visible entry at or above
    /// `min_depth` and mint its reward as a fresh, unconfirmed entry.
    pub async fn stake_once(&self, min_depth: u32) -> Option<EntryId> {
        let mut state = self.state.write().await;
        if !state.consumer_enabled {
            return None;
        }
        let position = state
            .entries
            .iter()
            .position(|s| !s.locked && s.entry.confirmations >= min_depth)?;
        let spent = state.entries.remove(position).entry;
        let txid = state.next_txid("stake");
        let reward = spent.amount + state.stake_reward;
        state.journal.push(LedgerEvent::CompetitorConsumed(spent.id.clone()));
        state.mine(1);
        state.entries.push(StoredEntry {
            entry: Entry::new(EntryId::new(txid.0, 0), reward, 0),
            locked: false,
        });
        debug!(entry = %spent.id, "Competitor consumed entry");
        Some(spent.id)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn list_entries(&self) -> Result<Vec<Entry>> {
        let mut state = self.state.write().await;
        state.journal.push(LedgerEvent::ListEntries);
        if state.faults.failing_lists > 0 {
            state.faults.failing_lists -= 1;
            return Err(SpreaderError::rpc("listunspent", "wallet is warming up"));
        }
        Ok(state
            .entries
            .iter()
            .filter(|s| !s.locked)
            .map(|s| s.entry.clone())
            .collect())
    }

    async fn current_height(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        state.journal.push(LedgerEvent::CurrentHeight);
        if state.faults.failing_heights > 0 {
            state.faults.failing_heights -= 1;
            return Err(SpreaderError::rpc("getblockcount", "connection refused"));
        }
        Ok(state.height)
    }

    async fn set_all_visible(&self, visible: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.journal.push(LedgerEvent::SetAllVisible(visible));
        for stored in &mut state.entries {
            stored.locked = !visible;
        }
        state.snapshot_visibility();
        Ok(())
    }

    async fn set_visible(&self, entries: &[EntryId], visible: bool) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        state.journal.push(LedgerEvent::SetVisible {
            ids: entries.to_vec(),
            visible,
        });

        if !visible {
            if let Some(spent) = state.faults.spend_before_lock.clone() {
                if entries.contains(&spent) {
                    state.faults.spend_before_lock = None;
                    state.consume(&spent);
                }
            }
        }

        // lockunspent rejects the whole batch when any outpoint is unknown
        let unknown = entries
            .iter()
            .find(|id| !state.entries.iter().any(|s| &s.entry.id == *id))
            .cloned();
        if let Some(id) = unknown {
            return Err(SpreaderError::rpc(
                "lockunspent",
                format!("Invalid parameter, unknown transaction {}", id),
            ));
        }

        for stored in &mut state.entries {
            if entries.contains(&stored.entry.id) {
                stored.locked = !visible;
            }
        }
        state.snapshot_visibility();

        if visible {
            if let Some(stolen) = state.faults.steal_on_unlock.clone() {
                if entries.contains(&stolen) {
                    state.faults.steal_on_unlock = None;
                    state.consume(&stolen);
                    state.snapshot_visibility();
                }
            }
        }
        Ok(())
    }

    async fn new_destination(&self) -> Result<Destination> {
        let mut state = self.state.write().await;
        state.journal.push(LedgerEvent::NewDestination);
        state.next_destination += 1;
        Ok(Destination::new(format!("dest-{:04}", state.next_destination)))
    }

    async fn broadcast_fan_out(&self, outputs: &[(Destination, Decimal)]) -> Result<Option<TxId>> {
        let mut state = self.state.write().await;

        if state.faults.empty_broadcasts > 0 {
            state.faults.empty_broadcasts -= 1;
            state.journal.push(LedgerEvent::Broadcast { inputs: Vec::new(), txid: None });
            return Ok(None);
        }

        let needed: Decimal = outputs.iter().map(|(_, amount)| *amount).sum::<Decimal>() + state.fee;

        let mut candidates: Vec<(usize, Decimal)> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.locked)
            .map(|(i, s)| (i, s.entry.amount))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut picked = Vec::new();
        let mut gathered = Decimal::ZERO;
        for (index, amount) in candidates {
            if gathered >= needed {
                break;
            }
            picked.push(index);
            gathered += amount;
        }

        if gathered < needed {
            state.journal.push(LedgerEvent::Broadcast { inputs: Vec::new(), txid: None });
            return Ok(None);
        }

        picked.sort_unstable();
        let inputs: Vec<EntryId> = picked.iter().map(|&i| state.entries[i].entry.id.clone()).collect();
        for index in picked.into_iter().rev() {
            state.entries.remove(index);
        }

        let txid = state.next_txid("fanout");
        for (vout, (destination, amount)) in outputs.iter().enumerate() {
            state.entries.push(StoredEntry {
                entry: Entry::new(EntryId::new(txid.0.clone(), vout as u32), *amount, 0)
                    .with_address(destination.as_str()),
                locked: false,
            });
        }
        let change = gathered - needed;
        if change > Decimal::ZERO {
            state.entries.push(StoredEntry {
                entry: Entry::new(EntryId::new(txid.0.clone(), outputs.len() as u32), change, 0),
                locked: false,
            });
        }

        state.journal.push(LedgerEvent::Broadcast {
            inputs: inputs.clone(),
            txid: Some(txid.clone()),
        });
        if state.auto_mine {
            state.mine(1);
        }
        info!(txid = %txid, inputs = inputs.len(), outputs = outputs.len(), "Fake ledger broadcast");
        Ok(Some(txid))
    }

    async fn set_background_consumer_enabled(&self, enabled: bool) {
        let mut state = self.state.write().await;
        state.journal.push(LedgerEvent::ConsumerEnabled(enabled));
        state.consumer_enabled = enabled;
    }
}

/// Opaque background actor that spends whatever it can see, on its own timer
pub struct Competitor {
    ledger: Arc<InMemoryLedger>,
    interval: Duration,
    min_depth: u32,
}

impl Competitor {
    pub fn new(ledger: Arc<InMemoryLedger>, interval: Duration) -> Self {
        Self {
            ledger,
            interval,
            min_depth: 1,
        }
    }

    pub fn with_min_depth(mut self, min_depth: u32) -> Self {
        self.min_depth = min_depth;
        self
    }

    pub fn spawn(self) -> CompetitorHandle {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.ledger.stake_once(self.min_depth).await;
            }
        });
        CompetitorHandle { handle }
    }
}

/// Stops the competitor when dropped
pub struct CompetitorHandle {
    handle: JoinHandle<()>,
}

impl CompetitorHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for CompetitorHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
