//! Link abstraction between a peer session and the byte transport.
//!
//! A [`PeerLink`] is what a [`Dialer`] hands back for a live connection: a
//! narrow [`ProtocolDriver`] capability for sending and closing, plus the
//! stream of decoded inbound messages.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cfnode_messages::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::signal::{signal_pair, Signal, Trigger};
use crate::NetworkError;

/// Default per-link queue depth in each direction.
pub const DEFAULT_LINK_CAPACITY: usize = 256;

/// Send/close capability over one connection.
pub trait ProtocolDriver: Send + Sync {
    /// Queue a message for writing without waiting.
    fn queue_message(&self, msg: Message) -> Result<(), NetworkError>;

    /// Close the connection. Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Fires once the connection is closed from either side.
    fn closed(&self) -> Signal;
}

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> Result<PeerLink, NetworkError>;
}

/// A freshly established connection.
pub struct PeerLink {
    pub addr: SocketAddr,
    pub inbound: bool,
    pub driver: Arc<dyn ProtocolDriver>,
    pub incoming: mpsc::Receiver<Message>,
}

/// [`ProtocolDriver`] backed by a bounded channel drained by a writer task.
pub struct ChannelDriver {
    outgoing: mpsc::Sender<Message>,
    close: Trigger,
}

impl ChannelDriver {
    pub fn new(outgoing: mpsc::Sender<Message>, close: Trigger) -> Self {
        Self { outgoing, close }
    }
}

impl ProtocolDriver for ChannelDriver {
    fn queue_message(&self, msg: Message) -> Result<(), NetworkError> {
        if self.close.is_fired() {
            return Err(NetworkError::LinkClosed);
        }
        match self.outgoing.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NetworkError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(NetworkError::LinkClosed),
        }
    }

    fn disconnect(&self) {
        self.close.fire();
    }

    fn is_connected(&self) -> bool {
        !self.close.is_fired() && !self.outgoing.is_closed()
    }

    fn closed(&self) -> Signal {
        self.close.signal()
    }
}

/// The far end of an in-process link.
pub struct RemoteEnd {
    /// Messages the local side queued.
    pub sent: mpsc::Receiver<Message>,
    /// Deliver messages to the local side. Dropping it closes the link.
    pub deliver: mpsc::Sender<Message>,
    /// Fires when the local side disconnects.
    pub closed: Signal,
}

/// Build an in-process link, useful for tests and simulations.
pub fn memory_link(addr: SocketAddr, capacity: usize) -> (PeerLink, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (close, closed) = signal_pair();
    let link = PeerLink {
        addr,
        inbound: false,
        driver: Arc::new(ChannelDriver::new(out_tx, close)),
        incoming: in_rx,
    };
    let remote = RemoteEnd {
        sent: out_rx,
        deliver: in_tx,
        closed,
    };
    (link, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "8.8.8.8:8333".parse().unwrap()
    }

    #[tokio::test]
    async fn memory_link_moves_messages_both_ways() {
        let (mut link, mut remote) = memory_link(addr(), 4);
        link.driver.queue_message(Message::Ping(1)).unwrap();
        assert_eq!(remote.sent.recv().await, Some(Message::Ping(1)));

        remote.deliver.send(Message::Pong(1)).await.unwrap();
        assert_eq!(link.incoming.recv().await, Some(Message::Pong(1)));
    }

    #[tokio::test]
    async fn disconnect_is_observed_remotely() {
        let (link, remote) = memory_link(addr(), 4);
        assert!(link.driver.is_connected());
        link.driver.disconnect();
        link.driver.disconnect();
        remote.closed.fired().await;
        assert!(!link.driver.is_connected());
        assert!(matches!(
            link.driver.queue_message(Message::Verack),
            Err(NetworkError::LinkClosed)
        ));
    }

    #[test]
    fn full_queue_is_reported() {
        let (link, _remote) = memory_link(addr(), 1);
        link.driver.queue_message(Message::Verack).unwrap();
        assert!(matches!(
            link.driver.queue_message(Message::Verack),
            Err(NetworkError::QueueFull)
        ));
    }
}
