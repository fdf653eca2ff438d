//! Outbound address-selection policy.
//!
//! Two pieces: the fast/relaxed search mode, re-evaluated on a timer from the
//! live peer count and sync-peer presence, and the per-attempt candidate
//! filter applied while searching the address source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use cfnode_types::{NetAddress, Timestamp};

use crate::address_book::KnownAddress;

/// Attempts during which recently tried addresses are skipped.
pub const RECENT_ATTEMPT_TRIES: u32 = 10;
/// An attempt this recent (seconds) counts as recent.
pub const RECENT_ATTEMPT_SECS: u64 = 10 * 60;
/// Attempts during which non-default ports are skipped.
pub const NON_DEFAULT_PORT_TRIES: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    /// Search aggressively for any usable peer.
    Fast,
    /// Enough peers and a sync peer: be picky.
    Relaxed,
}

/// Decides mode transitions.
#[derive(Clone, Copy, Debug)]
pub struct ModePolicy {
    pub target_outbound: usize,
    pub relaxed_enough_peers: usize,
}

impl ModePolicy {
    pub fn enough_peers(&self, peer_count: usize) -> bool {
        peer_count >= self.relaxed_enough_peers || peer_count == self.target_outbound
    }

    /// Mode to use after observing `peer_count` and sync-peer presence.
    pub fn next_mode(&self, current: SearchMode, peer_count: usize, has_sync_peer: bool) -> SearchMode {
        let enough = self.enough_peers(peer_count);
        match current {
            SearchMode::Relaxed if !has_sync_peer || !enough => SearchMode::Fast,
            SearchMode::Fast if has_sync_peer && enough => SearchMode::Relaxed,
            unchanged => unchanged,
        }
    }
}

/// Shared, lock-free view of the current mode.
#[derive(Debug, Default)]
pub struct ModeFlag {
    relaxed: AtomicBool,
}

impl ModeFlag {
    pub fn get(&self) -> SearchMode {
        if self.relaxed.load(Ordering::Acquire) {
            SearchMode::Relaxed
        } else {
            SearchMode::Fast
        }
    }

    pub fn set(&self, mode: SearchMode) {
        self.relaxed
            .store(mode == SearchMode::Relaxed, Ordering::Release);
    }
}

/// Per-search candidate filter. Create one per candidate search.
pub struct CandidateFilter<'a> {
    tries: u32,
    now: Timestamp,
    default_port: u16,
    is_banned: &'a dyn Fn(&NetAddress) -> bool,
    outbound_groups: &'a HashMap<String, usize>,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(
        now: Timestamp,
        default_port: u16,
        is_banned: &'a dyn Fn(&NetAddress) -> bool,
        outbound_groups: &'a HashMap<String, usize>,
    ) -> Self {
        Self {
            tries: 0,
            now,
            default_port,
            is_banned,
            outbound_groups,
        }
    }

    /// Candidates evaluated so far.
    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn accept(&mut self, candidate: &KnownAddress) -> bool {
        self.tries += 1;
        let addr = &candidate.addr;

        if (self.is_banned)(addr) {
            return false;
        }
        if self
            .outbound_groups
            .get(&addr.group_key())
            .is_some_and(|count| *count > 0)
        {
            return false;
        }
        if self.tries < RECENT_ATTEMPT_TRIES {
            let recent = candidate
                .last_attempt
                .is_some_and(|t| t.elapsed_since(self.now) < RECENT_ATTEMPT_SECS);
            if recent {
                return false;
            }
        }
        if self.tries < NON_DEFAULT_PORT_TRIES && addr.port != self.default_port {
            return false;
        }
        true
    }
}
