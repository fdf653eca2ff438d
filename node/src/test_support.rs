//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cfnode_messages::{HeadersMessage, InvMessage, VersionMessage, PROTOCOL_VERSION};
use cfnode_network::{
    AddressBook, BanLedger, InvWaiters, KnownTxns, MedianTime, PeerId, PeerIdAllocator,
};
use cfnode_nullables::{peer_version, NullClock, NullHeaderStore};
use cfnode_types::ServiceFlags;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::config::ChainServiceConfig;
use crate::context::{ServiceContext, TX_EVENT_CAPACITY};
use crate::metrics::NodeMetrics;
use crate::registry::{RegistryCommand, RegistryHandle, REGISTRY_QUEUE_CAPACITY};
use crate::session::PeerSession;
use crate::shutdown::ShutdownController;
use crate::sync_manager::SyncManager;

pub const LOCAL_NONCE: u64 = 42;

/// Sync manager that only records what it was told.
#[derive(Default)]
pub struct RecordingSync {
    pub new_peers: Mutex<Vec<PeerId>>,
    pub done_peers: Mutex<Vec<PeerId>>,
    pub invs: AtomicUsize,
    pub headers: AtomicUsize,
    pub sync_peer: Mutex<Option<PeerId>>,
    pub current: AtomicBool,
}

impl SyncManager for RecordingSync {
    fn new_peer(&self, peer: &Arc<PeerSession>) {
        self.new_peers.lock().push(peer.id());
    }

    fn done_peer(&self, peer: &Arc<PeerSession>) {
        self.done_peers.lock().push(peer.id());
    }

    fn queue_inv(&self, _inv: &InvMessage, _peer: &Arc<PeerSession>) {
        self.invs.fetch_add(1, Ordering::SeqCst);
    }

    fn queue_headers(&self, _headers: &HeadersMessage, _peer: &Arc<PeerSession>) {
        self.headers.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_peer(&self) -> Option<PeerId> {
        *self.sync_peer.lock()
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub ctx: Arc<ServiceContext>,
    pub registry_rx: mpsc::Receiver<RegistryCommand>,
    pub shutdown: ShutdownController,
    pub sync: Arc<RecordingSync>,
    pub clock: Arc<NullClock>,
    pub book: Arc<AddressBook>,
    pub headers: Arc<NullHeaderStore>,
}

impl Harness {
    /// Registry commands queued so far.
    pub fn commands(&mut self) -> Vec<RegistryCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.registry_rx.try_recv() {
            out.push(cmd);
        }
        out
    }
}

pub fn harness(config: ChainServiceConfig) -> Harness {
    let clock = Arc::new(NullClock::default());
    let shutdown = ShutdownController::new();
    let (registry, registry_rx) = RegistryHandle::channel(REGISTRY_QUEUE_CAPACITY, shutdown.signal());
    let sync = Arc::new(RecordingSync::default());
    let book = Arc::new(AddressBook::new(clock.clone()));
    let headers = Arc::new(NullHeaderStore::with_chain(10));
    let (tx_events, _) = broadcast::channel(TX_EVENT_CAPACITY);
    let ctx = Arc::new(ServiceContext {
        ban_ledger: Arc::new(BanLedger::new(config.ban_config(), clock.clone())),
        known_txns: Mutex::new(KnownTxns::new(config.known_txn_window())),
        config: Arc::new(config),
        clock: clock.clone(),
        header_store: headers.clone(),
        address_source: book.clone(),
        sync_manager: sync.clone(),
        registry,
        time_source: MedianTime::new(),
        inv_waiters: InvWaiters::new(),
        tx_events,
        metrics: Arc::new(NodeMetrics::new()),
        peer_ids: PeerIdAllocator::new(),
        shutdown: shutdown.signal(),
        local_nonce: LOCAL_NONCE,
    });
    Harness {
        ctx,
        registry_rx,
        shutdown,
        sync,
        clock,
        book,
        headers,
    }
}

/// A version message from a well-behaved remote peer.
pub fn version_from(services: ServiceFlags) -> VersionMessage {
    let mut version = peer_version(services, 100);
    version.nonce = 7;
    version.protocol_version = PROTOCOL_VERSION;
    version
}

/// Services every test peer advertises unless it is meant to be rejected.
pub fn full_services() -> ServiceFlags {
    ServiceFlags::NETWORK | ServiceFlags::WITNESS | ServiceFlags::CF
}
