//! One-shot cancellation signals.
//!
//! Every bounded wait in the transport (dial, graceful close) accepts a
//! [`SignalHandle`]; when the caller supplies none, an internal deadline
//! signal is created with [`SignalHandle::timeout`].

use std::time::Duration;

use tokio::sync::watch;

/// Owner side of a one-shot cancellation signal.
///
/// Triggering is idempotent; handles observe the first trigger and every
/// later one is a no-op.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Get a handle that can await the trigger.
    pub fn handle(&self) -> SignalHandle {
        SignalHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal, waking all handles.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable side of a [`Signal`].
#[derive(Debug, Clone)]
pub struct SignalHandle {
    rx: watch::Receiver<bool>,
}

impl SignalHandle {
    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires.
    ///
    /// If the owning [`Signal`] is dropped without firing, this never
    /// resolves; callers race it against the work being bounded.
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// A handle that fires after `after` has elapsed.
    pub fn timeout(after: Duration) -> SignalHandle {
        let signal = Signal::new();
        let handle = signal.handle();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            signal.trigger();
        });
        handle
    }
}
