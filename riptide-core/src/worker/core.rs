//! Worker orchestration
//!
//! Top-level driver: runs the discovery + lease-acquisition cycle and the
//! lease renewal cycle, keeps one consumer task per held lease, and manages
//! graceful shutdown with a bounded grace period.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::identity::WorkerIdentity;
use super::state::{PhasePublisher, WorkerPhase};
use crate::config::ConsumerConfig;
use crate::consumer::{ConsumerOutcome, ConsumerState, RecordDispatcher, RecordPipeline, ShardConsumer};
use crate::error::{Result, RiptideError};
use crate::lease::{LeaseCoordinator, LeaseStore};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::source::discovery::ShardDiscovery;
use crate::source::{ShardId, StreamSource};

/// Outcome of a graceful shutdown
#[derive(Debug)]
pub struct ShutdownReport {
    /// True when every consumer task drained within the grace period
    pub clean: bool,
    /// Tasks force-terminated after the grace period elapsed
    pub stragglers: usize,
}

struct ConsumerTask {
    handle: JoinHandle<ConsumerOutcome>,
    state_rx: watch::Receiver<ConsumerState>,
}

/// Stream consumption worker
///
/// Owns the lease coordinator, the discovery pass, and the pool of shard
/// consumer tasks. Collaborators are constructor-injected traits so tests
/// substitute fakes.
pub struct Worker {
    config: ConsumerConfig,
    worker_id: WorkerIdentity,
    source: Arc<dyn StreamSource>,
    coordinator: Arc<LeaseCoordinator>,
    discovery: ShardDiscovery,
    pipeline: Arc<dyn RecordPipeline>,
    shutdown: ShutdownSignal,
    phase: PhasePublisher,
}

impl Worker {
    /// Build a worker; the config is validated here
    pub fn new(
        config: ConsumerConfig,
        source: Arc<dyn StreamSource>,
        store: Arc<dyn LeaseStore>,
        pipeline: Arc<dyn RecordPipeline>,
    ) -> Result<Self> {
        config.validate()?;

        let worker_id = match &config.worker_id {
            Some(id) => WorkerIdentity::named(id.clone()),
            None => WorkerIdentity::generate(),
        };

        let coordinator = Arc::new(LeaseCoordinator::new(
            store.clone(),
            worker_id.as_str().to_string(),
            &config,
        ));
        let discovery = ShardDiscovery::new(
            source.clone(),
            store,
            config.initial_position.clone(),
            config.store_retry.clone(),
        );

        Ok(Self {
            config,
            worker_id,
            source,
            coordinator,
            discovery,
            pipeline,
            shutdown: ShutdownSignal::new(),
            phase: PhasePublisher::new(),
        })
    }

    /// This worker's identity among its peers
    pub fn worker_id(&self) -> &str {
        self.worker_id.as_str()
    }

    /// Signal handle for triggering shutdown from outside
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Observe the worker phase
    pub fn phase_watch(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    /// Run until shutdown is triggered or a worker-level error occurs
    pub async fn run(&self) -> Result<ShutdownReport> {
        info!(
            "Worker {} starting for stream {} (application {})",
            self.worker_id, self.config.stream_name, self.config.application_name
        );
        self.phase.set(WorkerPhase::Starting);

        let mut tasks: HashMap<ShardId, ConsumerTask> = HashMap::new();

        let mut coordination = interval(self.config.coordination_interval);
        coordination.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewal = interval(self.config.renewal_interval);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.listener();

        loop {
            tokio::select! {
                _ = coordination.tick() => {
                    if let Err(e) = self.coordination_cycle(&mut tasks).await {
                        if e.is_worker_fatal() {
                            return self.fail(e, &mut tasks).await;
                        }
                        warn!("Coordination cycle failed: {}", e);
                    }
                    if self.phase.get() == WorkerPhase::Starting {
                        self.phase.set(WorkerPhase::Running);
                    }
                }
                _ = renewal.tick() => {
                    match self.coordinator.renew_all().await {
                        Ok(lost) => {
                            for shard_id in lost {
                                // The consumer task saw the watch flip and
                                // is already stopping; it gets reaped on
                                // the next coordination cycle
                                debug!("Renewal lost shard {}", shard_id);
                            }
                        }
                        Err(e) => return self.fail(e, &mut tasks).await,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        self.phase.set(WorkerPhase::ShuttingDown);
        let stragglers = self.drain_tasks(&mut tasks).await;
        self.release_remaining().await;
        self.phase.set(WorkerPhase::Stopped);

        let report = ShutdownReport {
            clean: stragglers == 0,
            stragglers,
        };
        if report.clean {
            info!("Worker {} shut down cleanly", self.worker_id);
        } else {
            warn!(
                "Worker {} shut down with {} straggler task(s) force-terminated",
                self.worker_id, report.stragglers
            );
        }
        Ok(report)
    }

    /// One coordination cycle: reap finished tasks, sync the lease table,
    /// acquire available leases, and start consumers for newly held shards
    async fn coordination_cycle(&self, tasks: &mut HashMap<ShardId, ConsumerTask>) -> Result<()> {
        self.reap_finished(tasks).await;

        let report = self.discovery.refresh().await?;
        if !report.created.is_empty() || !report.retired.is_empty() {
            debug!(
                "Discovery created {} lease(s), retired {}",
                report.created.len(),
                report.retired.len()
            );
        }

        self.coordinator.take_cycle().await?;

        for shard_id in self.coordinator.held_shards().await {
            if !tasks.contains_key(&shard_id) {
                self.spawn_consumer(shard_id, tasks).await;
            }
        }
        standard::CONSUMERS_ACTIVE.set(tasks.len() as i64);
        Ok(())
    }

    async fn spawn_consumer(&self, shard_id: ShardId, tasks: &mut HashMap<ShardId, ConsumerTask>) {
        let owned_rx = match self.coordinator.ownership_watch(&shard_id).await {
            Some(rx) => rx,
            // Lost again between take_cycle and spawn
            None => return,
        };

        let dispatcher =
            RecordDispatcher::new(self.pipeline.clone(), self.config.dispatch_retry.clone());
        let (consumer, state_rx) = ShardConsumer::new(
            shard_id.clone(),
            self.source.clone(),
            self.coordinator.clone(),
            dispatcher,
            &self.config,
            owned_rx,
            self.shutdown.listener(),
        );

        info!("Starting consumer for shard {}", shard_id);
        let handle = tokio::spawn(consumer.run());
        tasks.insert(shard_id, ConsumerTask { handle, state_rx });
    }

    /// Remove tasks that ended since the last cycle
    async fn reap_finished(&self, tasks: &mut HashMap<ShardId, ConsumerTask>) {
        let finished: Vec<ShardId> = tasks
            .iter()
            .filter(|(_, t)| t.handle.is_finished())
            .map(|(shard_id, _)| shard_id.clone())
            .collect();

        for shard_id in finished {
            let task = tasks.remove(&shard_id).expect("finished task present");
            match task.handle.await {
                Ok(ConsumerOutcome::Stopped) => {
                    debug!("Consumer for shard {} stopped", shard_id)
                }
                Ok(ConsumerOutcome::Completed) => {
                    info!("Consumer for shard {} completed (shard end)", shard_id)
                }
                Ok(ConsumerOutcome::OwnershipLost) => {
                    info!(
                        "Consumer for shard {} removed: ownership lost; shard is eligible for re-acquisition",
                        shard_id
                    )
                }
                Ok(ConsumerOutcome::Failed(e)) => {
                    // Shard-local failure: stop renewing so the lease
                    // expires and a peer can take over; siblings keep
                    // running
                    error!("Consumer for shard {} failed: {}", shard_id, e);
                    standard::CONSUMER_FAILURES.inc();
                    self.coordinator.evict(&shard_id).await;
                }
                Err(join_err) => {
                    error!("Consumer task for shard {} panicked: {}", shard_id, join_err);
                    standard::CONSUMER_FAILURES.inc();
                    self.coordinator.evict(&shard_id).await;
                }
            }
        }
    }

    /// Wait out the grace period for consumer tasks, aborting stragglers
    async fn drain_tasks(&self, tasks: &mut HashMap<ShardId, ConsumerTask>) -> usize {
        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut stragglers = 0;

        for (shard_id, ConsumerTask { handle, state_rx }) in tasks.drain() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = handle.abort_handle();
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(outcome)) => {
                    debug!("Shard {} drained with outcome {:?}", shard_id, outcome)
                }
                Ok(Err(join_err)) => {
                    error!(
                        "Consumer task for shard {} panicked during shutdown: {}",
                        shard_id, join_err
                    )
                }
                Err(_) => {
                    warn!(
                        "Consumer for shard {} stuck in {:?} past the grace period, aborting",
                        shard_id,
                        *state_rx.borrow()
                    );
                    abort.abort();
                    stragglers += 1;
                }
            }
        }
        standard::CONSUMERS_ACTIVE.set(0);
        stragglers
    }

    /// Release leases still held after draining (aborted stragglers)
    async fn release_remaining(&self) {
        for shard_id in self.coordinator.held_shards().await {
            if let Err(e) = self.coordinator.release(&shard_id).await {
                warn!("Releasing lease for shard {} failed: {}", shard_id, e);
            }
        }
    }

    /// Worker-level fatal: stop everything and surface the error
    async fn fail(
        &self,
        error: RiptideError,
        tasks: &mut HashMap<ShardId, ConsumerTask>,
    ) -> Result<ShutdownReport> {
        error!("Worker {} failing: {}", self.worker_id, error);
        self.phase.set(WorkerPhase::Failed);
        self.shutdown.trigger();
        self.drain_tasks(tasks).await;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::PipelineError;
    use crate::lease::InMemoryLeaseStore;
    use crate::source::memory::InMemoryStreamSource;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    struct OkPipeline;

    #[async_trait]
    impl RecordPipeline for OkPipeline {
        async fn process(
            &self,
            _batch: &crate::source::RecordBatch,
        ) -> std::result::Result<(), PipelineError> {
            Ok(())
        }
    }

    fn fast_config() -> ConsumerConfig {
        let mut config = ConsumerConfig::new("orders", "order-indexer");
        config.worker_id = Some("worker-a".into());
        config.lease_duration = Duration::from_millis(500);
        config.renewal_interval = Duration::from_millis(100);
        config.coordination_interval = Duration::from_millis(50);
        config.checkpoint_records = 1;
        config.idle_poll_delay = Duration::from_millis(5);
        config.shutdown_grace = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn test_worker_consumes_and_shuts_down_clean() {
        let source = Arc::new(InMemoryStreamSource::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        let shard = source.create_shard("shard-0001");
        source.push_records(&shard, vec![("pk", Bytes::from_static(b"x"))]);

        let worker = Worker::new(
            fast_config(),
            source.clone(),
            store.clone(),
            Arc::new(OkPipeline),
        )
        .unwrap();

        let shutdown = worker.shutdown_signal();
        let mut phase = worker.phase_watch();

        let handle = tokio::spawn(async move { worker.run().await });

        // Wait until the worker is running with the shard consumed
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*phase.borrow_and_update(), WorkerPhase::Running);

        shutdown.trigger();
        let report = handle.await.unwrap().unwrap();
        assert!(report.clean);
        assert_eq!(report.stragglers, 0);

        // Checkpoint was committed before the lease was released
        let lease = store
            .get(&shard)
            .await
            .unwrap()
            .unwrap();
        assert!(lease.owner.is_none());
        assert!(!lease.checkpoint.is_sentinel());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let source = Arc::new(InMemoryStreamSource::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        let config = ConsumerConfig::default();

        let result = Worker::new(config, source, store, Arc::new(OkPipeline));
        assert!(matches!(
            result.err(),
            Some(RiptideError::InvalidConfig { .. })
        ));
    }
}
