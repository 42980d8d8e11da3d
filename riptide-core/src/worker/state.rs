//! Worker state machine
//!
//! The worker's phase is published through a single-writer watch channel;
//! observers subscribe instead of reading shared mutable state.

use tokio::sync::watch;

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Constructed, not yet running
    Created,
    /// Initial discovery and lease acquisition underway
    Starting,
    /// Coordination loop live, consumers running
    Running,
    /// Shutdown signalled, draining consumer tasks
    ShuttingDown,
    /// Clean exit
    Stopped,
    /// Unrecoverable error; external restart required
    Failed,
}

/// Single writer for the worker phase
pub struct PhasePublisher {
    tx: watch::Sender<WorkerPhase>,
}

impl PhasePublisher {
    /// Create a publisher starting in `Created`
    pub fn new() -> Self {
        let (tx, _) = watch::channel(WorkerPhase::Created);
        Self { tx }
    }

    /// Publish a new phase
    pub fn set(&self, phase: WorkerPhase) {
        // send_replace updates the value even with no live subscribers
        self.tx.send_replace(phase);
    }

    /// Current phase
    pub fn get(&self) -> WorkerPhase {
        *self.tx.borrow()
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<WorkerPhase> {
        self.tx.subscribe()
    }
}

impl Default for PhasePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_phase_transitions_observable() {
        let publisher = PhasePublisher::new();
        let mut rx = publisher.subscribe();
        assert_eq!(*rx.borrow(), WorkerPhase::Created);

        publisher.set(WorkerPhase::Starting);
        publisher.set(WorkerPhase::Running);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkerPhase::Running);
        assert_eq!(publisher.get(), WorkerPhase::Running);
    }
}
