//! Per-peer raw message fan-out.
//!
//! Delivery is lossy: a subscriber whose queue is full misses the message,
//! and the publisher never waits. Subscribers whose queue is closed or whose
//! quit signal fired are pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use cfnode_messages::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::signal::Signal;
use crate::PeerId;

/// A message received from a specific peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerMessage {
    pub peer: PeerId,
    pub message: Message,
}

struct Subscriber {
    queue: mpsc::Sender<PeerMessage>,
    quit: Signal,
}

/// Outcome of one publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishResult {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue. Returns a handle for [`SubscriberSet::unsubscribe`].
    pub fn subscribe(&self, queue: mpsc::Sender<PeerMessage>, quit: Signal) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, Subscriber { queue, quit });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn publish(&self, peer: PeerId, message: &Message) -> PublishResult {
        let mut result = PublishResult::default();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, sub| {
            if sub.quit.is_fired() {
                return false;
            }
            let item = PeerMessage {
                peer,
                message: message.clone(),
            };
            match sub.queue.try_send(item) {
                Ok(()) => {
                    result.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(peer = %peer, subscriber = id, command = message.command(), "subscriber queue full, dropping message");
                    result.dropped += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        result
    }
}
