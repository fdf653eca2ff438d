//! In-flight filter fetches, tracked by block height.
//!
//! A rollback must not race a filter fetch for a block it is about to remove,
//! so every fetch holds a [`PendingFilter`] guard for its height and rollbacks
//! wait until no guard above the target height is alive.

use std::collections::BTreeMap;
use std::sync::Arc;

use cfnode_network::Signal;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::NodeError;

#[derive(Clone)]
pub struct PendingFilters {
    inner: Arc<Inner>,
}

struct Inner {
    heights: Mutex<BTreeMap<u32, usize>>,
    changed: watch::Sender<u64>,
}

/// Held while a filter fetch for `height` is in flight.
pub struct PendingFilter {
    height: u32,
    inner: Arc<Inner>,
}

impl PendingFilters {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                heights: Mutex::new(BTreeMap::new()),
                changed,
            }),
        }
    }

    pub fn register(&self, height: u32) -> PendingFilter {
        *self.inner.heights.lock().entry(height).or_default() += 1;
        PendingFilter {
            height,
            inner: self.inner.clone(),
        }
    }

    /// Number of fetches in flight above `height`.
    pub fn count_above(&self, height: u32) -> usize {
        self.inner
            .heights
            .lock()
            .range(height.saturating_add(1)..)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Resolve once no fetch above `height` is in flight.
    pub async fn wait_above(&self, height: u32, shutdown: &Signal) -> Result<(), NodeError> {
        let mut changed = self.inner.changed.subscribe();
        loop {
            let pending = self.count_above(height);
            if pending == 0 {
                return Ok(());
            }
            tracing::debug!(height, pending, "waiting for filter fetches to finish");
            tokio::select! {
                _ = shutdown.fired() => return Err(NodeError::ShuttingDown),
                res = changed.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for PendingFilters {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PendingFilter {
    fn drop(&mut self) {
        {
            let mut heights = self.inner.heights.lock();
            if let Some(n) = heights.get_mut(&self.height) {
                *n -= 1;
                if *n == 0 {
                    heights.remove(&self.height);
                }
            }
        }
        self.inner.changed.send_modify(|generation| *generation += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waits_only_for_fetches_above_height() {
        let pending = PendingFilters::new();
        let low = pending.register(5);
        let high = pending.register(12);
        let also_high = pending.register(12);
        assert_eq!(pending.count_above(10), 2);
        assert_eq!(pending.count_above(4), 3);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait_above(10, &Signal::never()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(high);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(also_high);
        waiter.await.unwrap().unwrap();
        assert_eq!(pending.count_above(0), 1);
        drop(low);
        assert_eq!(pending.count_above(0), 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_wait() {
        let pending = PendingFilters::new();
        let _guard = pending.register(3);
        let (trigger, signal) = cfnode_network::signal_pair();
        trigger.fire();
        let err = pending.wait_above(1, &signal).await.unwrap_err();
        assert!(matches!(err, NodeError::ShuttingDown));
    }
}
