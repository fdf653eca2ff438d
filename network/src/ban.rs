//! Ban ledger: per-host misbehaviour scores and timed bans.
//!
//! Scores accumulate in two parts. The persistent part is written through to
//! a [`BanStore`] when one is configured; the transient part is dropped when
//! records are reloaded. Once the combined score reaches the threshold the
//! host is banned for a fixed duration and [`BanLedger::add_ban_score`]
//! reports the crossing exactly once.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use cfnode_store::{BanRecord, BanStore};
use cfnode_types::Clock;
use parking_lot::Mutex;

use crate::NetworkError;

/// Combined score at which a host is banned.
pub const DEFAULT_BAN_THRESHOLD: u32 = 100;
/// Score above which increases are logged as warnings.
pub const DEFAULT_BAN_WARN_THRESHOLD: u32 = 0;
/// Duration of a ban in seconds (24 hours).
pub const DEFAULT_BAN_DURATION_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct BanConfig {
    pub threshold: u32,
    pub warn_threshold: u32,
    pub duration_secs: u64,
    /// Never ban anyone.
    pub disabled: bool,
    /// Hosts that are never banned.
    pub whitelist: Vec<IpAddr>,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BAN_THRESHOLD,
            warn_threshold: DEFAULT_BAN_WARN_THRESHOLD,
            duration_secs: DEFAULT_BAN_DURATION_SECS,
            disabled: false,
            whitelist: Vec::new(),
        }
    }
}

pub struct BanLedger {
    config: BanConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, BanRecord>>,
    store: Option<Arc<dyn BanStore>>,
}

/// Reduce `ip:port` (or a bare IP) to the host key bans are recorded under.
pub fn ban_key(addr: &str) -> String {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return ip.to_string();
    }
    addr.to_string()
}

impl BanLedger {
    pub fn new(config: BanConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            records: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Build a ledger backed by `store`, loading every persisted record.
    pub fn with_store(
        config: BanConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn BanStore>,
    ) -> Result<Self, NetworkError> {
        let mut records = HashMap::new();
        for (host, mut record) in store.iter_bans()? {
            record.transient = 0;
            records.insert(host, record);
        }
        tracing::debug!(records = records.len(), "loaded ban records");
        Ok(Self {
            config,
            clock,
            records: Mutex::new(records),
            store: Some(store),
        })
    }

    pub fn config(&self) -> &BanConfig {
        &self.config
    }

    fn is_whitelisted(&self, host: &str) -> bool {
        host.parse::<IpAddr>()
            .map(|ip| self.config.whitelist.contains(&ip))
            .unwrap_or(false)
    }

    /// Add to a host's scores. Returns `true` only when this call moved the
    /// host into the banned state; the caller must then disconnect it.
    pub fn add_ban_score(&self, addr: &str, persistent: u32, transient: u32, reason: &str) -> bool {
        let host = ban_key(addr);
        if self.config.disabled || self.is_whitelisted(&host) {
            tracing::debug!(host = %host, reason, "ignoring ban score");
            return false;
        }
        let now = self.clock.now();

        let mut records = self.records.lock();
        let record = records.entry(host.clone()).or_default();
        if let Some(until) = record.banned_until {
            if now < until {
                return false;
            }
            *record = BanRecord::default();
        }

        record.persistent = record.persistent.saturating_add(persistent);
        record.transient = record.transient.saturating_add(transient);
        record.reason = reason.to_string();
        let score = record.score();
        if score > self.config.warn_threshold {
            tracing::warn!(host = %host, score, reason, "misbehaving peer");
        }

        let crossed = score >= self.config.threshold;
        if crossed {
            record.banned_until = Some(now.plus_secs(self.config.duration_secs));
            tracing::warn!(host = %host, score, reason, until = %now.plus_secs(self.config.duration_secs), "banned peer");
        }
        let snapshot = record.clone();
        drop(records);

        self.persist(&host, &snapshot);
        crossed
    }

    /// Whether `addr` is currently banned. Expired bans lapse here.
    pub fn is_banned(&self, addr: &str) -> bool {
        let host = ban_key(addr);
        let now = self.clock.now();
        let mut records = self.records.lock();
        let Some(record) = records.get(&host) else {
            return false;
        };
        if record.is_banned_at(now) {
            return true;
        }
        if record.banned_until.is_some() {
            records.remove(&host);
            drop(records);
            tracing::info!(host = %host, "ban expired");
            self.forget(&host);
        }
        false
    }

    /// Current combined score for `addr`.
    pub fn score(&self, addr: &str) -> u32 {
        self.records
            .lock()
            .get(&ban_key(addr))
            .map(BanRecord::score)
            .unwrap_or(0)
    }

    /// Clear every record for `addr`.
    pub fn unban(&self, addr: &str) {
        let host = ban_key(addr);
        self.records.lock().remove(&host);
        self.forget(&host);
    }

    /// Snapshot of every record, banned or not.
    pub fn enumerate(&self) -> Vec<(String, BanRecord)> {
        let mut all: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(host, record)| (host.clone(), record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn persist(&self, host: &str, record: &BanRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_ban(host, record) {
                tracing::warn!(host, error = %e, "failed to persist ban record");
            }
        }
    }

    fn forget(&self, host: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_ban(host) {
                tracing::warn!(host, error = %e, "failed to delete ban record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfnode_store::StoreError;
    use cfnode_types::Timestamp;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestClock(AtomicU64);

    impl Clock for TestClock {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.0.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct MemStore(Mutex<HashMap<String, BanRecord>>);

    impl BanStore for MemStore {
        fn put_ban(&self, host: &str, record: &BanRecord) -> Result<(), StoreError> {
            self.0.lock().insert(host.to_string(), record.clone());
            Ok(())
        }
        fn get_ban(&self, host: &str) -> Result<Option<BanRecord>, StoreError> {
            Ok(self.0.lock().get(host).cloned())
        }
        fn delete_ban(&self, host: &str) -> Result<(), StoreError> {
            self.0.lock().remove(host);
            Ok(())
        }
        fn iter_bans(&self) -> Result<Vec<(String, BanRecord)>, StoreError> {
            Ok(self.0.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
    }

    fn ledger() -> (BanLedger, Arc<TestClock>) {
        let clock = Arc::new(TestClock(AtomicU64::new(1_000)));
        (BanLedger::new(BanConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn crossing_is_reported_once() {
        let (ledger, _) = ledger();
        assert!(!ledger.add_ban_score("1.2.3.4:8333", 60, 0, "a"));
        assert!(!ledger.is_banned("1.2.3.4:8333"));
        assert!(ledger.add_ban_score("1.2.3.4:8333", 0, 40, "b"));
        assert!(ledger.is_banned("1.2.3.4:8333"));
        // Past the threshold further scoring is a no-op.
        assert!(!ledger.add_ban_score("1.2.3.4:8333", 50, 50, "c"));
        assert_eq!(ledger.score("1.2.3.4"), 100);
    }

    #[test]
    fn bans_cover_every_port_of_a_host() {
        let (ledger, _) = ledger();
        assert!(ledger.add_ban_score("1.2.3.4:8333", 100, 0, "x"));
        assert!(ledger.is_banned("1.2.3.4:18333"));
        assert!(ledger.is_banned("1.2.3.4"));
        assert!(!ledger.is_banned("1.2.3.5:8333"));
    }

    #[test]
    fn bans_expire_and_reset_scores() {
        let (ledger, clock) = ledger();
        assert!(ledger.add_ban_score("1.2.3.4", 100, 0, "x"));
        clock.0.fetch_add(DEFAULT_BAN_DURATION_SECS, Ordering::SeqCst);
        assert!(!ledger.is_banned("1.2.3.4"));
        assert_eq!(ledger.score("1.2.3.4"), 0);
        assert!(!ledger.add_ban_score("1.2.3.4", 10, 0, "y"));
    }

    #[test]
    fn whitelist_and_disabled_never_ban() {
        let clock = Arc::new(TestClock(AtomicU64::new(0)));
        let config = BanConfig {
            whitelist: vec!["9.9.9.9".parse().unwrap()],
            ..Default::default()
        };
        let ledger = BanLedger::new(config, clock.clone());
        assert!(!ledger.add_ban_score("9.9.9.9:8333", 500, 0, "x"));
        assert!(!ledger.is_banned("9.9.9.9"));

        let disabled = BanLedger::new(
            BanConfig {
                disabled: true,
                ..Default::default()
            },
            clock,
        );
        assert!(!disabled.add_ban_score("1.1.1.1", 500, 0, "x"));
    }

    #[test]
    fn reload_keeps_persistent_score_only() {
        let clock = Arc::new(TestClock(AtomicU64::new(0)));
        let store = Arc::new(MemStore::default());
        let ledger =
            BanLedger::with_store(BanConfig::default(), clock.clone(), store.clone()).unwrap();
        ledger.add_ban_score("1.2.3.4", 30, 50, "x");
        ledger.add_ban_score("5.6.7.8", 100, 0, "y");

        let reloaded = BanLedger::with_store(BanConfig::default(), clock, store).unwrap();
        assert_eq!(reloaded.score("1.2.3.4"), 30);
        assert!(reloaded.is_banned("5.6.7.8"));
        reloaded.unban("5.6.7.8");
        assert!(!reloaded.is_banned("5.6.7.8"));
        assert_eq!(reloaded.enumerate().len(), 1);
    }
}
