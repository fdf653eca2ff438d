//! Time-windowed set of transaction ids already requested from peers.
//!
//! Entries are kept in first-seen order so the sweep only touches expired
//! entries at the front.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use cfnode_types::Txid;
use tokio::time::Instant;

/// How long an announced txid suppresses further fetches.
pub const KNOWN_TXN_WINDOW: Duration = Duration::from_secs(20 * 60);

pub struct KnownTxns {
    window: Duration,
    first_seen: HashMap<Txid, Instant>,
    order: VecDeque<(Instant, Txid)>,
}

impl KnownTxns {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            first_seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Drop entries first seen at least one window before `now`.
    pub fn sweep(&mut self, now: Instant) {
        while let Some(&(seen, txid)) = self.order.front() {
            if now.saturating_duration_since(seen) < self.window {
                break;
            }
            self.order.pop_front();
            if self.first_seen.get(&txid) == Some(&seen) {
                self.first_seen.remove(&txid);
            }
        }
    }

    /// Sweep, then record and return the txids not seen within the window.
    pub fn filter_new<I>(&mut self, txids: I, now: Instant) -> Vec<Txid>
    where
        I: IntoIterator<Item = Txid>,
    {
        self.sweep(now);
        let mut fresh = Vec::new();
        for txid in txids {
            if self.first_seen.contains_key(&txid) {
                continue;
            }
            self.first_seen.insert(txid, now);
            self.order.push_back((now, txid));
            fresh.push(txid);
        }
        fresh
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.first_seen.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}

impl Default for KnownTxns {
    fn default() -> Self {
        Self::new(KNOWN_TXN_WINDOW)
    }
}
