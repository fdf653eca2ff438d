//! Callers waiting to see a hash announced in peer inventory.

use std::collections::HashMap;

use cfnode_messages::{InvMessage, InvVect};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::PeerId;

/// Queue depth of each waiter.
pub const INV_WAITER_CAPACITY: usize = 256;

/// One sighting of a watched hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvSighting {
    pub peer: PeerId,
    pub inv: InvVect,
}

#[derive(Default)]
pub struct InvWaiters {
    waiters: Mutex<HashMap<[u8; 32], Vec<mpsc::Sender<InvSighting>>>>,
}

impl InvWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening for `hash`. Several listeners may watch one hash.
    pub fn listen(&self, hash: [u8; 32]) -> mpsc::Receiver<InvSighting> {
        let (tx, rx) = mpsc::channel(INV_WAITER_CAPACITY);
        self.waiters.lock().entry(hash).or_default().push(tx);
        rx
    }

    /// Stop every listener for `hash`.
    pub fn stop(&self, hash: &[u8; 32]) {
        self.waiters.lock().remove(hash);
    }

    pub fn is_watching(&self, hash: &[u8; 32]) -> bool {
        self.waiters.lock().contains_key(hash)
    }

    /// Deliver every watched vector in `inv` without blocking.
    pub fn notify(&self, peer: PeerId, inv: &InvMessage) -> usize {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for item in &inv.items {
            let Some(queues) = waiters.get_mut(&item.hash) else {
                continue;
            };
            queues.retain(|queue| match queue.try_send(InvSighting { peer, inv: *item }) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(peer = %peer, "inventory waiter full, dropping sighting");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if queues.is_empty() {
                waiters.remove(&item.hash);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfnode_types::Txid;

    #[tokio::test]
    async fn sightings_reach_every_listener() {
        let waiters = InvWaiters::new();
        let txid = Txid::hash(b"tx");
        let mut a = waiters.listen(*txid.as_bytes());
        let mut b = waiters.listen(*txid.as_bytes());

        let inv = InvMessage::new(vec![InvVect::tx(Txid::hash(b"other")), InvVect::tx(txid)]);
        assert_eq!(waiters.notify(PeerId::new(7), &inv), 2);
        assert_eq!(a.recv().await.unwrap().peer, PeerId::new(7));
        assert_eq!(b.recv().await.unwrap().inv, InvVect::tx(txid));
    }

    #[test]
    fn stop_and_dropped_receivers_clean_up() {
        let waiters = InvWaiters::new();
        let hash = [3u8; 32];
        let rx = waiters.listen(hash);
        drop(rx);
        let inv = InvMessage::new(vec![InvVect { inv_type: cfnode_messages::InvType::Block, hash }]);
        assert_eq!(waiters.notify(PeerId::new(1), &inv), 0);
        assert!(!waiters.is_watching(&hash));

        let _rx = waiters.listen(hash);
        waiters.stop(&hash);
        assert!(!waiters.is_watching(&hash));
    }
}
