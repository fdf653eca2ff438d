//! Persistent ban records.

use cfnode_types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Accumulated misbehaviour for one host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    /// Score that survives restarts.
    pub persistent: u32,
    /// Score that only lives for this process.
    pub transient: u32,
    /// Set once the combined score crossed the threshold.
    pub banned_until: Option<Timestamp>,
    /// Reason attached to the most recent score increase.
    pub reason: String,
}

impl BanRecord {
    pub fn score(&self) -> u32 {
        self.persistent.saturating_add(self.transient)
    }

    pub fn is_banned_at(&self, now: Timestamp) -> bool {
        matches!(self.banned_until, Some(until) if now < until)
    }
}

/// Trait for persisting ban records across restarts.
///
/// Keys are host strings (IP addresses without port).
pub trait BanStore: Send + Sync {
    fn put_ban(&self, host: &str, record: &BanRecord) -> Result<(), StoreError>;

    fn get_ban(&self, host: &str) -> Result<Option<BanRecord>, StoreError>;

    fn delete_ban(&self, host: &str) -> Result<(), StoreError>;

    /// All stored `(host, record)` pairs.
    fn iter_bans(&self) -> Result<Vec<(String, BanRecord)>, StoreError>;
}
