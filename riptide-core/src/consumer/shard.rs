//! Per-shard consumer task
//!
//! One task per leased shard: polls records at the current position,
//! dispatches batches downstream, and commits checkpoints only after the
//! pipeline acknowledged everything up to that position. Stops promptly on
//! shutdown or ownership loss.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::dispatch::RecordDispatcher;
use crate::config::ConsumerConfig;
use crate::error::RiptideError;
use crate::lease::{Checkpoint, CommitOutcome, LeaseCoordinator};
use crate::metrics::standard;
use crate::retry::RetryPolicy;
use crate::runtime::ShutdownListener;
use crate::source::{ReadPosition, RecordBatch, RecordPoll, SequenceNumber, ShardId, StreamSource};

/// Consumer task state, published through a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Resolving the start position from the lease checkpoint
    Starting,
    /// Waiting on the stream source
    Polling,
    /// Waiting on the downstream pipeline
    Dispatching,
    /// Draining: final checkpoint and lease release
    Stopping,
    /// Terminal, clean
    Stopped,
    /// Terminal, unrecoverable for this shard
    Failed,
}

/// How a consumer task ended
#[derive(Debug)]
pub enum ConsumerOutcome {
    /// Graceful stop on shutdown, final checkpoint flushed
    Stopped,
    /// Shard consumed to SHARD_END
    Completed,
    /// Lease stolen by a peer; no further work was committed
    OwnershipLost,
    /// Unrecoverable dispatch or store error for this shard
    Failed(RiptideError),
}

enum StopCause {
    Shutdown,
    OwnershipLost,
    Completed,
    Failed(RiptideError),
}

/// Consumer task for one leased shard
pub struct ShardConsumer {
    shard_id: ShardId,
    source: Arc<dyn StreamSource>,
    coordinator: Arc<LeaseCoordinator>,
    dispatcher: RecordDispatcher,
    poll_batch_limit: usize,
    idle_poll_delay: Duration,
    checkpoint_interval: Duration,
    checkpoint_records: u64,
    source_retry: RetryPolicy,
    owned_rx: watch::Receiver<bool>,
    shutdown: ShutdownListener,
    state_tx: watch::Sender<ConsumerState>,
}

impl ShardConsumer {
    /// Create a consumer for a shard this worker holds the lease of
    ///
    /// Returns the consumer and a receiver observing its state.
    pub fn new(
        shard_id: ShardId,
        source: Arc<dyn StreamSource>,
        coordinator: Arc<LeaseCoordinator>,
        dispatcher: RecordDispatcher,
        config: &ConsumerConfig,
        owned_rx: watch::Receiver<bool>,
        shutdown: ShutdownListener,
    ) -> (Self, watch::Receiver<ConsumerState>) {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Starting);
        let consumer = Self {
            shard_id,
            source,
            coordinator,
            dispatcher,
            poll_batch_limit: config.poll_batch_limit,
            idle_poll_delay: config.idle_poll_delay,
            checkpoint_interval: config.checkpoint_interval,
            checkpoint_records: config.checkpoint_records,
            source_retry: config.store_retry.clone(),
            owned_rx,
            shutdown,
            state_tx,
        };
        (consumer, state_rx)
    }

    /// Run until shutdown, ownership loss, shard end, or failure
    pub async fn run(mut self) -> ConsumerOutcome {
        self.set_state(ConsumerState::Starting);

        let lease = match self.coordinator.held_lease(&self.shard_id).await {
            Some(lease) => lease,
            None => {
                // Lost between acquisition and task start
                self.set_state(ConsumerState::Stopped);
                return ConsumerOutcome::OwnershipLost;
            }
        };

        let mut committed = lease.checkpoint.clone();
        if committed == Checkpoint::ShardEnd {
            self.set_state(ConsumerState::Stopped);
            return ConsumerOutcome::Completed;
        }

        info!(
            "Consumer for shard {} starting at checkpoint {}",
            self.shard_id, committed
        );

        let mut position = Self::read_position(&committed);
        // Last dispatched-but-uncommitted sequence number
        let mut pending: Option<SequenceNumber> = None;
        let mut records_since_commit: u64 = 0;
        let mut last_commit = Instant::now();

        let cause = loop {
            if self.shutdown.triggered() {
                break StopCause::Shutdown;
            }
            if !*self.owned_rx.borrow() {
                break StopCause::OwnershipLost;
            }

            self.set_state(ConsumerState::Polling);
            let poll = match self.poll(&position).await {
                Ok(poll) => poll,
                Err(e) => break StopCause::Failed(e),
            };
            if let Some(behind) = poll.millis_behind {
                standard::MILLIS_BEHIND.set(behind as i64);
            }

            let empty = poll.records.is_empty();
            if !empty {
                self.set_state(ConsumerState::Dispatching);
                let batch = RecordBatch {
                    shard_id: self.shard_id.clone(),
                    records: poll.records,
                };
                if let Err(e) = self.dispatcher.dispatch(&batch).await {
                    break StopCause::Failed(RiptideError::DispatchFailed {
                        shard_id: self.shard_id.clone(),
                        checkpoint: committed.clone(),
                        class: e.class(),
                        message: e.to_string(),
                    });
                }
                pending = batch.last_sequence().cloned();
                records_since_commit += batch.len() as u64;
            }
            position = poll.next_position;

            if poll.end_of_shard {
                // SHARD_END supersedes any pending sequence checkpoint
                match self
                    .coordinator
                    .commit_checkpoint(&self.shard_id, Checkpoint::ShardEnd)
                    .await
                {
                    Ok(CommitOutcome::Committed) => break StopCause::Completed,
                    Ok(CommitOutcome::OwnershipLost) => break StopCause::OwnershipLost,
                    Err(e) => break StopCause::Failed(e),
                }
            }

            if self.checkpoint_due(records_since_commit, last_commit) {
                if let Some(seq) = pending.take() {
                    let next = Checkpoint::SequenceNumber(seq);
                    match self
                        .coordinator
                        .commit_checkpoint(&self.shard_id, next.clone())
                        .await
                    {
                        Ok(CommitOutcome::Committed) => {
                            committed = next;
                            records_since_commit = 0;
                            last_commit = Instant::now();
                        }
                        Ok(CommitOutcome::OwnershipLost) => break StopCause::OwnershipLost,
                        Err(e) => break StopCause::Failed(e),
                    }
                }
            }

            if empty {
                self.idle_wait().await;
            }
        };

        match cause {
            StopCause::Shutdown => {
                self.set_state(ConsumerState::Stopping);
                if let Some(seq) = pending.take() {
                    let next = Checkpoint::SequenceNumber(seq);
                    match self.coordinator.commit_checkpoint(&self.shard_id, next).await {
                        Ok(CommitOutcome::Committed) => {
                            debug!("Flushed final checkpoint for shard {}", self.shard_id)
                        }
                        Ok(CommitOutcome::OwnershipLost) => {
                            // Lost mid-shutdown: distinct from a clean stop
                            info!(
                                "Shard {} lost ownership during shutdown flush",
                                self.shard_id
                            );
                            self.set_state(ConsumerState::Stopped);
                            return ConsumerOutcome::OwnershipLost;
                        }
                        Err(e) => {
                            self.set_state(ConsumerState::Failed);
                            return ConsumerOutcome::Failed(e);
                        }
                    }
                }
                if let Err(e) = self.coordinator.release(&self.shard_id).await {
                    warn!("Releasing lease for shard {} failed: {}", self.shard_id, e);
                }
                self.set_state(ConsumerState::Stopped);
                ConsumerOutcome::Stopped
            }
            StopCause::OwnershipLost => {
                info!("Consumer for shard {} stopping: ownership lost", self.shard_id);
                self.set_state(ConsumerState::Stopped);
                ConsumerOutcome::OwnershipLost
            }
            StopCause::Completed => {
                self.set_state(ConsumerState::Stopping);
                info!("Shard {} fully consumed", self.shard_id);
                // Owner is cleared but the SHARD_END lease stays behind to
                // gate the children until discovery retires it
                if let Err(e) = self.coordinator.release(&self.shard_id).await {
                    warn!("Releasing lease for shard {} failed: {}", self.shard_id, e);
                }
                self.set_state(ConsumerState::Stopped);
                ConsumerOutcome::Completed
            }
            StopCause::Failed(e) => {
                error!(
                    "Consumer for shard {} failed at checkpoint {}: {}",
                    self.shard_id, committed, e
                );
                self.set_state(ConsumerState::Failed);
                ConsumerOutcome::Failed(e)
            }
        }
    }

    fn read_position(checkpoint: &Checkpoint) -> ReadPosition {
        match checkpoint {
            Checkpoint::TrimHorizon => ReadPosition::TrimHorizon,
            Checkpoint::Latest => ReadPosition::Latest,
            Checkpoint::AtTimestamp(ts) => ReadPosition::AtTimestamp(*ts),
            Checkpoint::SequenceNumber(seq) => ReadPosition::AfterSequence(seq.clone()),
            // Callers handle ShardEnd before resolving a position
            Checkpoint::ShardEnd => ReadPosition::Latest,
        }
    }

    fn checkpoint_due(&self, records_since_commit: u64, last_commit: Instant) -> bool {
        records_since_commit >= self.checkpoint_records
            || last_commit.elapsed() >= self.checkpoint_interval
    }

    async fn poll(&self, position: &ReadPosition) -> Result<RecordPoll, RiptideError> {
        let mut attempt = 0;
        loop {
            match self
                .source
                .get_records(&self.shard_id, position, self.poll_batch_limit)
                .await
            {
                Ok(poll) => return Ok(poll),
                Err(e) if e.is_retryable() && attempt + 1 < self.source_retry.max_attempts => {
                    warn!(
                        "Poll attempt {}/{} for shard {} failed: {}",
                        attempt + 1,
                        self.source_retry.max_attempts,
                        self.shard_id,
                        e
                    );
                    tokio::time::sleep(self.source_retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RiptideError::SourceExhausted {
                        shard_id: self.shard_id.clone(),
                        attempts: attempt + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn idle_wait(&mut self) {
        let delay = self.idle_poll_delay;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.recv() => {}
            _ = self.owned_rx.changed() => {}
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::dispatch::{PipelineError, RecordPipeline};
    use crate::lease::{InMemoryLeaseStore, Lease, LeaseStore};
    use crate::source::memory::InMemoryStreamSource;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct CollectingPipeline {
        seen: Mutex<Vec<SequenceNumber>>,
    }

    #[async_trait]
    impl RecordPipeline for CollectingPipeline {
        async fn process(&self, batch: &RecordBatch) -> Result<(), PipelineError> {
            let mut seen = self.seen.lock();
            seen.extend(batch.records.iter().map(|r| r.sequence_number.clone()));
            Ok(())
        }
    }

    fn config() -> ConsumerConfig {
        let mut config = ConsumerConfig::new("orders", "order-indexer");
        config.lease_duration = Duration::from_secs(5);
        config.renewal_interval = Duration::from_millis(500);
        config.idle_poll_delay = Duration::from_millis(5);
        config.checkpoint_records = 1;
        config
    }

    async fn setup(
        shard: &str,
    ) -> (
        Arc<InMemoryStreamSource>,
        Arc<InMemoryLeaseStore>,
        Arc<LeaseCoordinator>,
        ShardId,
    ) {
        let source = Arc::new(InMemoryStreamSource::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        let shard_id = source.create_shard(shard);
        store
            .create(Lease::new(
                shard_id.clone(),
                Checkpoint::TrimHorizon,
                Vec::new(),
            ))
            .await
            .unwrap();
        let coordinator = Arc::new(LeaseCoordinator::new(
            store.clone() as Arc<dyn LeaseStore>,
            "worker-a".to_string(),
            &config(),
        ));
        coordinator.take_cycle().await.unwrap();
        (source, store, coordinator, shard_id)
    }

    async fn consumer(
        source: &Arc<InMemoryStreamSource>,
        coordinator: &Arc<LeaseCoordinator>,
        shard_id: &ShardId,
        pipeline: Arc<dyn RecordPipeline>,
        cfg: &ConsumerConfig,
        shutdown: ShutdownListener,
    ) -> ShardConsumer {
        let dispatcher = RecordDispatcher::new(pipeline, cfg.dispatch_retry.clone());
        let owned_rx = coordinator.ownership_watch(shard_id).await.unwrap();
        let (consumer, _state) = ShardConsumer::new(
            shard_id.clone(),
            source.clone() as Arc<dyn StreamSource>,
            coordinator.clone(),
            dispatcher,
            cfg,
            owned_rx,
            shutdown,
        );
        consumer
    }

    #[tokio::test]
    async fn test_closed_shard_runs_to_completed() {
        let (source, store, coordinator, shard_id) = setup("shard-0001").await;
        let seqs = source.push_records(
            &shard_id,
            vec![
                ("pk", Bytes::from_static(b"a")),
                ("pk", Bytes::from_static(b"b")),
            ],
        );
        source.close_shard(&shard_id);

        let pipeline = Arc::new(CollectingPipeline {
            seen: Mutex::new(Vec::new()),
        });
        let shutdown = crate::runtime::ShutdownSignal::new();
        let c = consumer(
            &source,
            &coordinator,
            &shard_id,
            pipeline.clone(),
            &config(),
            shutdown.listener(),
        )
        .await;

        let outcome = c.run().await;
        assert!(matches!(outcome, ConsumerOutcome::Completed));
        assert_eq!(*pipeline.seen.lock(), seqs);

        let lease = store.get(&shard_id).await.unwrap().unwrap();
        assert_eq!(lease.checkpoint, Checkpoint::ShardEnd);
        assert!(lease.owner.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_checkpoint() {
        let (source, store, coordinator, shard_id) = setup("shard-0001").await;
        let seqs = source.push_records(&shard_id, vec![("pk", Bytes::from_static(b"a"))]);

        // High thresholds keep the checkpoint pending until shutdown
        let mut cfg = config();
        cfg.checkpoint_records = 1000;
        cfg.checkpoint_interval = Duration::from_secs(3600);

        let pipeline = Arc::new(CollectingPipeline {
            seen: Mutex::new(Vec::new()),
        });
        let shutdown = crate::runtime::ShutdownSignal::new();
        let c = consumer(
            &source,
            &coordinator,
            &shard_id,
            pipeline,
            &cfg,
            shutdown.listener(),
        )
        .await;

        let handle = tokio::spawn(c.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ConsumerOutcome::Stopped));

        let lease = store.get(&shard_id).await.unwrap().unwrap();
        assert_eq!(
            lease.checkpoint,
            Checkpoint::SequenceNumber(seqs[0].clone())
        );
        assert!(lease.owner.is_none());
    }
}
