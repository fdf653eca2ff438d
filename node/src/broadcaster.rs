//! Transaction broadcaster with rebroadcast on new blocks.
//!
//! A submitted transaction is sent to every live peer and tracked until the
//! caller marks it confirmed. Each new best block re-announces tracked
//! transactions whose rebroadcast interval has elapsed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfnode_messages::Message;
use cfnode_network::rebroadcast::MAX_TRACKED_TXS;
use cfnode_network::{RebroadcastTracker, Signal};
use cfnode_types::{Transaction, Txid};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::events::BlockEvent;
use crate::metrics::NodeMetrics;
use crate::registry::RegistryHandle;
use crate::NodeError;

/// Delivers a transaction to peers.
#[async_trait]
pub trait TxAnnouncer: Send + Sync {
    /// Returns how many peers the transaction was queued to.
    async fn announce(&self, tx: &Transaction) -> Result<usize, NodeError>;
}

/// Sends the transaction to every handshaken peer in the registry.
pub struct PeerAnnouncer {
    registry: RegistryHandle,
}

impl PeerAnnouncer {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TxAnnouncer for PeerAnnouncer {
    async fn announce(&self, tx: &Transaction) -> Result<usize, NodeError> {
        let peers = self.registry.peers().await?;
        let mut sent = 0;
        for peer in peers.iter().filter(|p| p.is_connected() && p.verack_received()) {
            if peer.queue_message(Message::Tx(tx.clone())).is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            return Err(NodeError::NoPeers);
        }
        Ok(sent)
    }
}

pub struct Broadcaster {
    announcer: Arc<dyn TxAnnouncer>,
    tracker: Mutex<RebroadcastTracker>,
    metrics: Arc<NodeMetrics>,
}

impl Broadcaster {
    pub fn new(announcer: Arc<dyn TxAnnouncer>, interval: Duration, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            announcer,
            tracker: Mutex::new(RebroadcastTracker::new(interval, MAX_TRACKED_TXS)),
            metrics,
        }
    }

    /// Send `tx` to all live peers and keep it for rebroadcast. With no
    /// peers the transaction is still kept and goes out on the next block.
    pub async fn broadcast(&self, tx: Transaction) -> Result<Txid, NodeError> {
        match self.announcer.announce(&tx).await {
            Ok(peers) => {
                let txid = self.tracker.lock().track(tx, Instant::now());
                self.metrics.txs_broadcast.inc();
                tracing::info!(txid = %txid, peers, "broadcast transaction");
                Ok(txid)
            }
            Err(NodeError::NoPeers) => {
                let txid = self.tracker.lock().track_unsent(tx, Instant::now());
                tracing::info!(txid = %txid, "no peers for transaction, holding for the next block");
                Err(NodeError::NoPeers)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop rebroadcasting `txid`. Returns whether it was tracked.
    pub fn mark_confirmed(&self, txid: &Txid) -> bool {
        let removed = self.tracker.lock().confirmed(txid);
        if removed {
            tracing::debug!(txid = %txid, "transaction confirmed");
        }
        removed
    }

    pub fn is_tracked(&self, txid: &Txid) -> bool {
        self.tracker.lock().contains(txid)
    }

    pub fn pending(&self) -> usize {
        self.tracker.lock().len()
    }

    /// Re-announce every tracked transaction that is due.
    /// Returns how many were announced.
    pub async fn handle_block(&self) -> usize {
        let due = self.tracker.lock().due(Instant::now());
        let mut announced = 0;
        for tx in due {
            match self.announcer.announce(&tx).await {
                Ok(_) => announced += 1,
                Err(e) => tracing::debug!(txid = %tx.txid(), error = %e, "rebroadcast failed"),
            }
        }
        if announced > 0 {
            self.metrics.txs_rebroadcast.inc_by(announced as u64);
            tracing::debug!(count = announced, "rebroadcast unconfirmed transactions");
        }
        announced
    }

    /// Rebroadcast on every connected block until shutdown.
    pub async fn run(self: Arc<Self>, mut blocks: broadcast::Receiver<BlockEvent>, shutdown: Signal) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.fired() => break,
                event = blocks.recv() => match event {
                    Ok(event) if event.is_connected() => {
                        self.handle_block().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "broadcaster lagged behind block events");
                        self.handle_block().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("broadcaster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfnode_types::{BlockHash, BlockStamp, OutPoint, Script, Timestamp, TxIn, TxOut};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAnnouncer {
        announced: AtomicUsize,
        offline: AtomicBool,
    }

    #[async_trait]
    impl TxAnnouncer for CountingAnnouncer {
        async fn announce(&self, _tx: &Transaction) -> Result<usize, NodeError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(NodeError::NoPeers);
            }
            self.announced.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }
    }

    fn tx(tag: u8) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn {
                previous_output: OutPoint::new(Txid::hash(&[tag]), 0),
                script_sig: Script::new(vec![]),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 10_000,
                script_pubkey: Script::new(vec![0x51]),
            }],
            lock_time: 0,
        }
    }

    fn connected(height: u32) -> BlockEvent {
        BlockEvent::Connected(BlockStamp {
            height,
            hash: BlockHash::hash(&height.to_le_bytes()),
            timestamp: Timestamp::new(1_700_000_000),
        })
    }

    const INTERVAL: Duration = Duration::from_secs(300);

    fn broadcaster(announcer: Arc<CountingAnnouncer>) -> Broadcaster {
        Broadcaster::new(announcer, INTERVAL, Arc::new(NodeMetrics::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn rebroadcasts_each_block_after_the_interval() {
        let announcer = Arc::new(CountingAnnouncer::default());
        let b = broadcaster(announcer.clone());
        let txid = b.broadcast(tx(1)).await.unwrap();
        assert_eq!(announcer.announced.load(Ordering::SeqCst), 1);

        for round in 1..=3 {
            tokio::time::advance(INTERVAL + Duration::from_secs(1)).await;
            assert_eq!(b.handle_block().await, 1);
            assert_eq!(announcer.announced.load(Ordering::SeqCst), 1 + round);
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(b.handle_block().await, 0);
        assert_eq!(announcer.announced.load(Ordering::SeqCst), 4);
        assert!(b.is_tracked(&txid));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_transactions_are_forgotten() {
        let announcer = Arc::new(CountingAnnouncer::default());
        let b = broadcaster(announcer.clone());
        let txid = b.broadcast(tx(2)).await.unwrap();
        assert!(b.mark_confirmed(&txid));
        assert!(!b.mark_confirmed(&txid));

        tokio::time::advance(INTERVAL * 2).await;
        assert_eq!(b.handle_block().await, 0);
        assert_eq!(b.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_without_peers_goes_out_on_the_next_block() {
        let announcer = Arc::new(CountingAnnouncer::default());
        announcer.offline.store(true, Ordering::SeqCst);
        let b = broadcaster(announcer.clone());
        let err = b.broadcast(tx(3)).await.unwrap_err();
        assert!(matches!(err, NodeError::NoPeers));
        assert!(b.is_tracked(&tx(3).txid()));
        assert_eq!(b.metrics.txs_broadcast.get(), 0);

        announcer.offline.store(false, Ordering::SeqCst);
        assert_eq!(b.handle_block().await, 1);
        assert_eq!(announcer.announced.load(Ordering::SeqCst), 1);
        // Announced now, so the interval applies again.
        assert_eq!(b.handle_block().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_reacts_to_connected_blocks_only() {
        let announcer = Arc::new(CountingAnnouncer::default());
        let b = Arc::new(broadcaster(announcer.clone()));
        b.broadcast(tx(4)).await.unwrap();

        let (events, rx) = broadcast::channel(8);
        let (trigger, signal) = cfnode_network::signal_pair();
        let task = tokio::spawn(b.clone().run(rx, signal));

        tokio::time::advance(INTERVAL + Duration::from_secs(1)).await;
        let stamp = match connected(11) {
            BlockEvent::Connected(stamp) => stamp,
            _ => unreachable!(),
        };
        events
            .send(BlockEvent::Disconnected {
                stamp,
                new_tip: stamp,
            })
            .unwrap();
        events.send(connected(11)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(announcer.announced.load(Ordering::SeqCst), 2);

        trigger.fire();
        task.await.unwrap();
    }
}
