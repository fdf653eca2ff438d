//! Unconfirmed-transaction rebroadcast tracking.
//!
//! Transactions stay tracked until confirmed. Each one is due again once the
//! rebroadcast interval has elapsed since it was last announced.

use std::collections::HashMap;
use std::time::Duration;

use cfnode_types::{Transaction, Txid};
use tokio::time::Instant;

/// Default minimum spacing between announcements of one transaction.
pub const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Maximum tracked transactions.
pub const MAX_TRACKED_TXS: usize = 4_096;

struct PendingTx {
    tx: Transaction,
    submitted_at: Instant,
    /// `None` until the transaction reached a peer.
    last_broadcast: Option<Instant>,
    broadcast_count: u32,
}

pub struct RebroadcastTracker {
    pending: HashMap<Txid, PendingTx>,
    interval: Duration,
    max_entries: usize,
}

impl RebroadcastTracker {
    pub fn new(interval: Duration, max_entries: usize) -> Self {
        Self {
            pending: HashMap::new(),
            interval,
            max_entries,
        }
    }

    /// Start tracking a transaction that was just announced.
    pub fn track(&mut self, tx: Transaction, now: Instant) -> Txid {
        self.insert(tx, now, true)
    }

    /// Start tracking a transaction no peer has seen yet. It is due at the
    /// next check.
    pub fn track_unsent(&mut self, tx: Transaction, now: Instant) -> Txid {
        self.insert(tx, now, false)
    }

    fn insert(&mut self, tx: Transaction, now: Instant, announced: bool) -> Txid {
        let txid = tx.txid();
        if !self.pending.contains_key(&txid) && self.pending.len() >= self.max_entries {
            if let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.submitted_at)
                .map(|(id, _)| *id)
            {
                tracing::debug!(txid = %oldest, "evicting oldest unconfirmed transaction");
                self.pending.remove(&oldest);
            }
        }
        self.pending.insert(
            txid,
            PendingTx {
                tx,
                submitted_at: now,
                last_broadcast: announced.then_some(now),
                broadcast_count: u32::from(announced),
            },
        );
        txid
    }

    /// Transactions due for another announcement. Marks them announced.
    pub fn due(&mut self, now: Instant) -> Vec<Transaction> {
        let mut result = Vec::new();
        for pending in self.pending.values_mut() {
            let due = pending
                .last_broadcast
                .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
            if due {
                pending.last_broadcast = Some(now);
                pending.broadcast_count += 1;
                result.push(pending.tx.clone());
            }
        }
        result
    }

    /// Stop tracking a confirmed transaction.
    pub fn confirmed(&mut self, txid: &Txid) -> bool {
        self.pending.remove(txid).is_some()
    }

    /// How many times `txid` has been announced so far.
    pub fn broadcast_count(&self, txid: &Txid) -> Option<u32> {
        self.pending.get(txid).map(|p| p.broadcast_count)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.pending.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RebroadcastTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REBROADCAST_INTERVAL, MAX_TRACKED_TXS)
    }
}
