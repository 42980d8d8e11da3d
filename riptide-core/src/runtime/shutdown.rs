//! Graceful shutdown handling
//!
//! Cooperative shutdown signaling: consumer tasks observe the signal at
//! their next suspension point, finish in-flight work, and stop.

use tokio::sync::watch;

/// Shutdown signal broadcaster
///
/// Clone freely; any clone can trigger. Listeners observe the signal
/// through [`ShutdownListener`].
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Trigger shutdown; idempotent
    pub fn trigger(&self) {
        // send_replace latches the signal even with no live listeners
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create a listener for this signal
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task view of the shutdown signal
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Whether shutdown has been triggered
    pub fn triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until shutdown is triggered
    ///
    /// Returns immediately if it already has been.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Signal dropped; treat as shutdown
                return;
            }
        }
    }
}
