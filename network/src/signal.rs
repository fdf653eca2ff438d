//! One-shot cancellation signal.
//!
//! A [`Trigger`] fires once; every [`Signal`] cloned from it observes the
//! firing, including signals created afterwards. Dropping the trigger counts
//! as firing, so loops never outlive their owner.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Trigger {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone, Debug)]
pub struct Signal {
    rx: watch::Receiver<bool>,
    _keep_alive: Option<Arc<watch::Sender<bool>>>,
}

/// Create a connected trigger/signal pair.
pub fn signal_pair() -> (Trigger, Signal) {
    let (tx, rx) = watch::channel(false);
    (
        Trigger { tx: Arc::new(tx) },
        Signal {
            rx,
            _keep_alive: None,
        },
    )
}

impl Trigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> Signal {
        Signal {
            rx: self.tx.subscribe(),
            _keep_alive: None,
        }
    }
}

impl Signal {
    /// A signal whose trigger can never fire.
    pub fn never() -> Signal {
        let (tx, rx) = watch::channel(false);
        Signal {
            rx,
            _keep_alive: Some(Arc::new(tx)),
        }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
