//! Graceful shutdown for the chain service.
//!
//! [`ShutdownController`] owns the one-shot quit [`Trigger`]; every task
//! holds a [`Signal`] and `select!`s on it alongside its main loop.
//! [`TaskTracker`] collects the spawned handles so `stop` can wait for them.

use std::future::Future;

use cfnode_network::{signal_pair, Signal, Trigger};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Coordinates graceful shutdown across all chain-service tasks.
pub struct ShutdownController {
    trigger: Trigger,
    signal: Signal,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (trigger, signal) = signal_pair();
        Self { trigger, signal }
    }

    /// A signal that fires on shutdown.
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        self.trigger.fire();
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles of every background task, awaited on stop.
#[derive(Default)]
pub struct TaskTracker {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Tasks not yet finished.
    pub fn len(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every tracked task, including ones spawned while waiting.
    pub async fn join_all(&self) {
        loop {
            let batch: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        tracing::error!(error = %e, "background task panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn programmatic_shutdown_fires_signals() {
        let controller = ShutdownController::new();
        let a = controller.signal();
        let b = controller.signal();
        controller.shutdown();
        a.fired().await;
        b.fired().await;
        assert!(a.is_fired());
    }

    #[tokio::test]
    async fn join_all_waits_for_nested_spawns() {
        let tracker = Arc::new(TaskTracker::new());
        let done = Arc::new(AtomicUsize::new(0));
        let (t, d) = (tracker.clone(), done.clone());
        tracker.spawn(async move {
            let d2 = d.clone();
            t.spawn(async move {
                tokio::task::yield_now().await;
                d2.fetch_add(1, Ordering::SeqCst);
            });
            d.fetch_add(1, Ordering::SeqCst);
        });
        tracker.join_all().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert!(tracker.is_empty());
    }
}
