//! Fixtures shared by the chain-service integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfnode_messages::{HeadersMessage, InvMessage, Message};
use cfnode_network::{AddressBook, PeerId, RemoteEnd};
use cfnode_node::{ChainService, ChainServiceConfig, ChainServiceDeps, PeerDescriptor, PeerSession, SyncManager};
use cfnode_nullables::{DialedLink, NullBanStore, NullClock, NullDialer, NullHeaderStore};
use cfnode_types::ServiceFlags;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Sync manager that records peer arrivals and departures.
#[derive(Default)]
pub struct RecordingSync {
    pub new_peers: Mutex<Vec<PeerId>>,
    pub done_peers: Mutex<Vec<PeerId>>,
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

    fn queue_inv(&self, _inv: &InvMessage, _peer: &Arc<PeerSession>) {}

    fn queue_headers(&self, _headers: &HeadersMessage, _peer: &Arc<PeerSession>) {}

    fn sync_peer(&self) -> Option<PeerId> {
        *self.sync_peer.lock()
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }
}

pub struct Node {
    pub service: ChainService,
    pub headers: Arc<NullHeaderStore>,
    pub sync: Arc<RecordingSync>,
    pub bans: Arc<NullBanStore>,
    pub clock: Arc<NullClock>,
    pub links: mpsc::UnboundedReceiver<DialedLink>,
}

/// Services every well-behaved test peer advertises.
pub fn full_services() -> ServiceFlags {
    ServiceFlags::NETWORK | ServiceFlags::WITNESS | ServiceFlags::CF
}

/// A config that only dials `peers`, with no DNS seeding.
pub fn persistent_config(peers: &[&str]) -> ChainServiceConfig {
    ChainServiceConfig {
        connect_peers: peers.iter().map(|p| p.to_string()).collect(),
        dns_seeds: vec![],
        ..ChainServiceConfig::default()
    }
}

pub fn node(config: ChainServiceConfig, headers: NullHeaderStore) -> Node {
    let clock = Arc::new(NullClock::default());
    let headers = Arc::new(headers);
    let sync = Arc::new(RecordingSync::default());
    let bans = Arc::new(NullBanStore::new());
    let (dialer, links) = NullDialer::new();
    let service = ChainService::new(
        config,
        ChainServiceDeps {
            header_store: headers.clone(),
            address_source: Arc::new(AddressBook::new(clock.clone())),
            sync_manager: sync.clone(),
            dialer: Arc::new(dialer),
            ban_store: Some(bans.clone()),
            clock: clock.clone(),
        },
    )
    .expect("valid config");
    Node {
        service,
        headers,
        sync,
        bans,
        clock,
        links,
    }
}

/// Poll until every registered peer has completed the handshake.
pub async fn wait_for_peers(service: &ChainService, count: usize) -> Vec<PeerDescriptor> {
    for _ in 0..200 {
        let peers = service.peers().await.expect("registry running");
        if peers.len() == count && peers.iter().all(|p| p.verack_received) {
            return peers;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} handshaken peers");
}

/// Receive the next message the node sent that `pick` accepts, skipping
/// the rest.
pub async fn next_sent<T>(remote: &mut RemoteEnd, mut pick: impl FnMut(Message) -> Option<T>) -> T {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let msg = remote.sent.recv().await.expect("link open");
            if let Some(found) = pick(msg) {
                return found;
            }
        }
    })
    .await
    .expect("node sent the expected message")
}
