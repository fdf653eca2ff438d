//! Outbound candidate selection over the address source.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cfnode_network::{AddressSource, BanLedger, CandidateFilter, ModeFlag, NetworkError, SearchMode};
use cfnode_types::{Clock, NetAddress};

use crate::registry::RegistryHandle;
use crate::supervisor::CandidateSource;
use crate::NodeError;

/// Picks addresses from the address source through the diversity and
/// freshness filter, honouring the current search mode.
pub struct OutboundCandidates {
    address_source: Arc<dyn AddressSource>,
    ban_ledger: Arc<BanLedger>,
    registry: RegistryHandle,
    mode: Arc<ModeFlag>,
    clock: Arc<dyn Clock>,
    default_port: u16,
}

impl OutboundCandidates {
    pub fn new(
        address_source: Arc<dyn AddressSource>,
        ban_ledger: Arc<BanLedger>,
        registry: RegistryHandle,
        mode: Arc<ModeFlag>,
        clock: Arc<dyn Clock>,
        default_port: u16,
    ) -> Self {
        Self {
            address_source,
            ban_ledger,
            registry,
            mode,
            clock,
            default_port,
        }
    }
}

#[async_trait]
impl CandidateSource for OutboundCandidates {
    async fn next_candidate(&self) -> Result<SocketAddr, NodeError> {
        let groups = self.registry.outbound_groups().await?;
        let relaxed = self.mode.get() == SearchMode::Relaxed;
        let is_banned = |addr: &NetAddress| self.ban_ledger.is_banned(&addr.key());
        let mut filter = CandidateFilter::new(self.clock.now(), self.default_port, &is_banned, &groups);
        let picked = self
            .address_source
            .get_candidate(relaxed, &mut |known| filter.accept(known))
            .ok_or(NetworkError::NoCandidate)?;
        tracing::debug!(addr = %picked.addr, tries = filter.tries(), relaxed, "picked outbound candidate");
        self.address_source.mark_attempt(&picked.addr);
        Ok(picked.addr.socket_addr())
    }
}
