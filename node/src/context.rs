//! State shared by peer sessions, the registry actor and the chain service.

use std::sync::Arc;

use cfnode_network::{
    AddressSource, BanLedger, InvWaiters, KnownTxns, MedianTime, PeerIdAllocator, Signal,
};
use cfnode_store::HeaderStore;
use cfnode_types::{Clock, Transaction};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::ChainServiceConfig;
use crate::metrics::NodeMetrics;
use crate::registry::RegistryHandle;
use crate::sync_manager::SyncManager;

/// Capacity of the received-transaction broadcast channel.
pub const TX_EVENT_CAPACITY: usize = 256;

pub struct ServiceContext {
    pub config: Arc<ChainServiceConfig>,
    pub clock: Arc<dyn Clock>,
    pub header_store: Arc<dyn HeaderStore>,
    pub address_source: Arc<dyn AddressSource>,
    pub sync_manager: Arc<dyn SyncManager>,
    pub ban_ledger: Arc<BanLedger>,
    pub registry: RegistryHandle,
    pub time_source: MedianTime,
    pub known_txns: Mutex<KnownTxns>,
    pub inv_waiters: InvWaiters,
    /// Transactions received from peers.
    pub tx_events: broadcast::Sender<Transaction>,
    pub metrics: Arc<NodeMetrics>,
    pub peer_ids: PeerIdAllocator,
    pub shutdown: Signal,
    /// Nonce sent in our version messages, used to detect self-connections.
    pub local_nonce: u64,
}

impl ServiceContext {
    /// Height reported in our version message.
    pub fn best_height(&self) -> i32 {
        match self.header_store.chain_tip() {
            Ok((_, height)) => i32::try_from(height).unwrap_or(i32::MAX),
            Err(e) => {
                tracing::debug!(error = %e, "no chain tip for version message");
                0
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_fired()
    }
}
