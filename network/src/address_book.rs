//! Address source contract and an in-memory address book.

use std::collections::HashMap;
use std::sync::Arc;

use cfnode_types::{address::is_routable, Clock, NetAddress, ServiceFlags, Timestamp};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// Below this many known addresses the book asks peers for more.
pub const NEED_ADDRESS_THRESHOLD: usize = 1_000;
/// In relaxed mode, addresses attempted this recently are not offered.
pub const RELAXED_RETRY_SECS: u64 = 60 * 60;
/// Random picks per candidate search. Picks repeat, so a small book still
/// reaches the filter's later, looser tries.
pub const MAX_CANDIDATE_TRIES: usize = 100;

/// A candidate address plus the book's bookkeeping for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownAddress {
    pub addr: NetAddress,
    pub attempts: u32,
    pub last_attempt: Option<Timestamp>,
    pub last_success: Option<Timestamp>,
}

impl KnownAddress {
    pub fn new(addr: NetAddress) -> Self {
        Self {
            addr,
            attempts: 0,
            last_attempt: None,
            last_success: None,
        }
    }
}

/// Supplies outbound candidates and records what happened to them.
pub trait AddressSource: Send + Sync {
    /// Sample candidates until `filter` accepts one or the search gives up.
    /// `relaxed` asks for the stricter, slower search used once enough
    /// peers are connected.
    fn get_candidate(
        &self,
        relaxed: bool,
        filter: &mut dyn FnMut(&KnownAddress) -> bool,
    ) -> Option<KnownAddress>;

    /// Merge addresses learned from `source`.
    fn add_addresses(&self, addrs: &[NetAddress], source: &NetAddress);

    fn mark_attempt(&self, addr: &NetAddress);

    /// The address completed a handshake.
    fn mark_good(&self, addr: &NetAddress);

    /// The address is currently connected.
    fn mark_connected(&self, addr: &NetAddress);

    fn set_services(&self, addr: &NetAddress, services: ServiceFlags);

    fn need_more_addresses(&self) -> bool;
}

/// Address book kept in memory, keyed by `ip:port`.
pub struct AddressBook {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, KnownAddress>>,
}

impl AddressBook {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn get(&self, addr: &NetAddress) -> Option<KnownAddress> {
        self.entries.lock().get(&addr.key()).cloned()
    }

    /// Insert or replace one entry verbatim.
    pub fn insert(&self, known: KnownAddress) {
        self.entries.lock().insert(known.addr.key(), known);
    }
}

impl AddressSource for AddressBook {
    fn get_candidate(
        &self,
        relaxed: bool,
        filter: &mut dyn FnMut(&KnownAddress) -> bool,
    ) -> Option<KnownAddress> {
        let now = self.clock.now();
        let candidates: Vec<KnownAddress> = self.entries.lock().values().cloned().collect();
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CANDIDATE_TRIES {
            let known = candidates.choose(&mut rng)?;
            if relaxed
                && known
                    .last_attempt
                    .is_some_and(|t| t.elapsed_since(now) < RELAXED_RETRY_SECS)
            {
                continue;
            }
            if filter(known) {
                return Some(known.clone());
            }
        }
        None
    }

    fn add_addresses(&self, addrs: &[NetAddress], source: &NetAddress) {
        let mut entries = self.entries.lock();
        let mut added = 0usize;
        for addr in addrs {
            if !is_routable(addr.ip) && addr.ip != source.ip {
                continue;
            }
            match entries.get_mut(&addr.key()) {
                Some(existing) => {
                    if addr.timestamp > existing.addr.timestamp {
                        existing.addr.timestamp = addr.timestamp;
                    }
                    existing.addr.services |= addr.services;
                }
                None => {
                    entries.insert(addr.key(), KnownAddress::new(*addr));
                    added += 1;
                }
            }
        }
        tracing::debug!(source = %source, added, total = entries.len(), "merged addresses");
    }

    fn mark_attempt(&self, addr: &NetAddress) {
        let now = self.clock.now();
        if let Some(known) = self.entries.lock().get_mut(&addr.key()) {
            known.attempts += 1;
            known.last_attempt = Some(now);
        }
    }

    fn mark_good(&self, addr: &NetAddress) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let known = entries
            .entry(addr.key())
            .or_insert_with(|| KnownAddress::new(*addr));
        known.attempts = 0;
        known.last_success = Some(now);
        known.last_attempt = Some(now);
    }

    fn mark_connected(&self, addr: &NetAddress) {
        let now = self.clock.now();
        if let Some(known) = self.entries.lock().get_mut(&addr.key()) {
            known.addr.timestamp = now;
        }
    }

    fn set_services(&self, addr: &NetAddress, services: ServiceFlags) {
        if let Some(known) = self.entries.lock().get_mut(&addr.key()) {
            known.addr.services = services;
        }
    }

    fn need_more_addresses(&self) -> bool {
        self.entries.lock().len() < NEED_ADDRESS_THRESHOLD
    }
}
