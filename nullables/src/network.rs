//! Nullable network: in-process links instead of sockets.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cfnode_messages::{Message, VersionMessage, PROTOCOL_VERSION};
use cfnode_network::{memory_link, Dialer, NetworkError, PeerLink, RemoteEnd};
use cfnode_types::{ServiceFlags, Timestamp};
use tokio::sync::mpsc;

const LINK_CAPACITY: usize = 256;

/// The test's side of a connection the node dialed.
pub struct DialedLink {
    pub addr: SocketAddr,
    pub remote: RemoteEnd,
}

/// A dialer that hands the far end of every connection to the test.
pub struct NullDialer {
    links: mpsc::UnboundedSender<DialedLink>,
    refused: Mutex<HashSet<SocketAddr>>,
    refuse_all: AtomicBool,
    attempts: Mutex<Vec<SocketAddr>>,
}

impl NullDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DialedLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            links,
            refused: Mutex::new(HashSet::new()),
            refuse_all: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        };
        (dialer, rx)
    }

    /// Fail every future dial to `addr`.
    pub fn refuse(&self, addr: SocketAddr) {
        self.refused.lock().unwrap().insert(addr);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Every address dialed so far, in order.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for NullDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<PeerLink, NetworkError> {
        self.attempts.lock().unwrap().push(addr);
        if self.refuse_all.load(Ordering::SeqCst) || self.refused.lock().unwrap().contains(&addr) {
            return Err(NetworkError::ConnectionFailed(format!("{addr} refused")));
        }
        let (link, remote) = memory_link(addr, LINK_CAPACITY);
        let _ = self.links.send(DialedLink { addr, remote });
        Ok(link)
    }
}

/// A version message from a well-behaved full node.
pub fn peer_version(services: ServiceFlags, start_height: i32) -> VersionMessage {
    VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        services,
        timestamp: Timestamp::now(),
        nonce: 0x5eed,
        user_agent: "/nullpeer:0.1.0/".into(),
        start_height,
        disable_relay_tx: false,
    }
}

/// Play the remote side of the handshake: wait for the node's version,
/// then answer with `version` and a verack.
pub async fn handshake(remote: &mut RemoteEnd, version: VersionMessage) -> Result<(), NetworkError> {
    let first = tokio::time::timeout(Duration::from_secs(5), remote.sent.recv())
        .await
        .map_err(|_| NetworkError::ConnectionFailed("no version from node".into()))?;
    match first {
        Some(Message::Version(_)) => {}
        other => {
            return Err(NetworkError::ConnectionFailed(format!(
                "expected version, got {other:?}"
            )))
        }
    }
    remote
        .deliver
        .send(Message::Version(version))
        .await
        .map_err(|_| NetworkError::LinkClosed)?;
    remote
        .deliver
        .send(Message::Verack)
        .await
        .map_err(|_| NetworkError::LinkClosed)
}
