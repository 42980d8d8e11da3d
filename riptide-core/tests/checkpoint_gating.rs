//! Checkpoint gating on dispatch acknowledgement
//!
//! A checkpoint only ever advances past a batch the pipeline acknowledged,
//! and never after ownership has been lost.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use riptide_core::config::ConsumerConfig;
use riptide_core::consumer::{
    ConsumerOutcome, PipelineError, RecordDispatcher, RecordPipeline, ShardConsumer,
};
use riptide_core::lease::{Checkpoint, InMemoryLeaseStore, Lease, LeaseCoordinator, LeaseStore};
use riptide_core::runtime::ShutdownSignal;
use riptide_core::source::memory::InMemoryStreamSource;
use riptide_core::source::{
    ReadPosition, RecordBatch, RecordPoll, SequenceNumber, Shard, ShardId, SourceError,
    StreamSource,
};

fn config() -> ConsumerConfig {
    let mut config = ConsumerConfig::new("orders", "order-indexer");
    config.lease_duration = Duration::from_millis(200);
    config.renewal_interval = Duration::from_millis(50);
    config.checkpoint_records = 1;
    config.idle_poll_delay = Duration::from_millis(5);
    config.dispatch_retry = riptide_core::retry::RetryPolicy::new(2, Duration::from_millis(1));
    config
}

async fn seeded(
    shard: &str,
) -> (
    Arc<InMemoryStreamSource>,
    Arc<InMemoryLeaseStore>,
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
    (source, store, shard_id)
}

async fn spawn_consumer(
    source: Arc<dyn StreamSource>,
    coordinator: Arc<LeaseCoordinator>,
    shard_id: &ShardId,
    pipeline: Arc<dyn RecordPipeline>,
    cfg: &ConsumerConfig,
    shutdown: &ShutdownSignal,
) -> tokio::task::JoinHandle<ConsumerOutcome> {
    let owned_rx = coordinator.ownership_watch(shard_id).await.unwrap();
    let dispatcher = RecordDispatcher::new(pipeline, cfg.dispatch_retry.clone());
    let (consumer, _state) = ShardConsumer::new(
        shard_id.clone(),
        source,
        coordinator,
        dispatcher,
        cfg,
        owned_rx,
        shutdown.listener(),
    );
    tokio::spawn(consumer.run())
}

struct RefusingPipeline;

#[async_trait]
impl RecordPipeline for RefusingPipeline {
    async fn process(&self, _batch: &RecordBatch) -> Result<(), PipelineError> {
        Err(PipelineError::retryable("pipeline down"))
    }
}

#[tokio::test]
async fn failed_dispatch_never_advances_the_checkpoint() {
    let (source, store, shard_id) = seeded("shard-0001").await;
    source.push_records(&shard_id, vec![("pk", Bytes::from_static(b"x"))]);

    let cfg = config();
    let coordinator = Arc::new(LeaseCoordinator::new(
        store.clone() as Arc<dyn LeaseStore>,
        "worker-a".to_string(),
        &cfg,
    ));
    coordinator.take_cycle().await.unwrap();

    let shutdown = ShutdownSignal::new();
    let handle = spawn_consumer(
        source.clone(),
        coordinator,
        &shard_id,
        Arc::new(RefusingPipeline),
        &cfg,
        &shutdown,
    )
    .await;

    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, ConsumerOutcome::Failed(_)));

    // Checkpoint untouched: the batch will be re-read by whoever takes over
    let lease = store.get(&shard_id).await.unwrap().unwrap();
    assert_eq!(lease.checkpoint, Checkpoint::TrimHorizon);
}

struct SucceedingPipeline;

#[async_trait]
impl RecordPipeline for SucceedingPipeline {
    async fn process(&self, _batch: &RecordBatch) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[tokio::test]
async fn successful_dispatch_checkpoints_the_last_record() {
    let (source, store, shard_id) = seeded("shard-0001").await;
    let seqs = source.push_records(
        &shard_id,
        vec![
            ("pk", Bytes::from_static(b"a")),
            ("pk", Bytes::from_static(b"b")),
            ("pk", Bytes::from_static(b"c")),
        ],
    );

    let cfg = config();
    let coordinator = Arc::new(LeaseCoordinator::new(
        store.clone() as Arc<dyn LeaseStore>,
        "worker-a".to_string(),
        &cfg,
    ));
    coordinator.take_cycle().await.unwrap();

    let shutdown = ShutdownSignal::new();
    let handle = spawn_consumer(
        source.clone(),
        coordinator,
        &shard_id,
        Arc::new(SucceedingPipeline),
        &cfg,
        &shutdown,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.trigger();
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, ConsumerOutcome::Stopped));

    let lease = store.get(&shard_id).await.unwrap().unwrap();
    assert_eq!(
        lease.checkpoint,
        Checkpoint::SequenceNumber(seqs[2].clone())
    );
}

/// Counts polls so the test can assert polling stopped after ownership loss
struct CountingSource {
    inner: Arc<InMemoryStreamSource>,
    polls: AtomicU32,
}

#[async_trait]
impl StreamSource for CountingSource {
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError> {
        self.inner.list_shards().await
    }

    async fn get_records(
        &self,
        shard_id: &ShardId,
        position: &ReadPosition,
        limit: usize,
    ) -> Result<RecordPoll, SourceError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_records(shard_id, position, limit).await
    }
}

/// Holds the batch in flight until released, so ownership can change under
/// a dispatch
struct SlowPipeline {
    release: Arc<AtomicBool>,
}

#[async_trait]
impl RecordPipeline for SlowPipeline {
    async fn process(&self, _batch: &RecordBatch) -> Result<(), PipelineError> {
        while !self.release.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn ownership_loss_mid_dispatch_commits_nothing_and_stops_polling() {
    let (source, store, shard_id) = seeded("shard-0001").await;
    source.push_records(&shard_id, vec![("pk", Bytes::from_static(b"x"))]);

    let counting = Arc::new(CountingSource {
        inner: source.clone(),
        polls: AtomicU32::new(0),
    });

    let cfg = config();
    let a = Arc::new(LeaseCoordinator::new(
        store.clone() as Arc<dyn LeaseStore>,
        "worker-a".to_string(),
        &cfg,
    ));
    a.take_cycle().await.unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let shutdown = ShutdownSignal::new();
    let handle = spawn_consumer(
        counting.clone(),
        a.clone(),
        &shard_id,
        Arc::new(SlowPipeline {
            release: release.clone(),
        }),
        &cfg,
        &shutdown,
    )
    .await;

    // While the batch is in flight, the lease expires and a peer steals it
    tokio::time::sleep(Duration::from_millis(250)).await;
    let b = LeaseCoordinator::new(
        store.clone() as Arc<dyn LeaseStore>,
        "worker-b".to_string(),
        &cfg,
    );
    assert_eq!(b.take_cycle().await.unwrap(), vec![shard_id.clone()]);

    // The in-flight dispatch completes, but its checkpoint must not land
    release.store(true, Ordering::SeqCst);
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, ConsumerOutcome::OwnershipLost));

    let lease = store.get(&shard_id).await.unwrap().unwrap();
    assert_eq!(lease.owner.as_deref(), Some("worker-b"));
    assert_eq!(lease.checkpoint, Checkpoint::TrimHorizon);

    // No poll happened after the loss was detected
    let polls_at_loss = counting.polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counting.polls.load(Ordering::SeqCst), polls_at_loss);
}

#[tokio::test]
async fn committed_checkpoints_are_monotonic() {
    let (source, store, shard_id) = seeded("shard-0001").await;
    source.push_records(&shard_id, vec![("pk", Bytes::from_static(b"x"))]);

    let cfg = config();
    let a = Arc::new(LeaseCoordinator::new(
        store.clone() as Arc<dyn LeaseStore>,
        "worker-a".to_string(),
        &cfg,
    ));
    a.take_cycle().await.unwrap();

    let commit = |seq: &str| {
        Checkpoint::SequenceNumber(SequenceNumber::new(seq))
    };
    a.commit_checkpoint(&shard_id, commit("10")).await.unwrap();
    a.commit_checkpoint(&shard_id, commit("11")).await.unwrap();
    assert!(a.commit_checkpoint(&shard_id, commit("10")).await.is_err());

    let lease = store.get(&shard_id).await.unwrap().unwrap();
    assert_eq!(lease.checkpoint, commit("11"));
}
