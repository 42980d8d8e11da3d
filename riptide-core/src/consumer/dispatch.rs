//! Record dispatch to the downstream pipeline
//!
//! The pipeline is an external collaborator. The dispatcher owns the retry
//! discipline: retryable failures get the same batch again with backoff,
//! fatal failures escalate immediately, and a batch only ever counts as
//! delivered as a whole.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::metrics::standard;
use crate::retry::RetryPolicy;
use crate::source::RecordBatch;

/// Classification of a terminal dispatch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchClass {
    /// Retries were exhausted on a transient condition
    Retryable,
    /// The pipeline rejected the batch outright
    Fatal,
}

/// Error returned by a pipeline implementation
#[derive(Debug, thiserror::Error)]
#[error("{class:?} pipeline error: {message}")]
pub struct PipelineError {
    /// Whether the same batch may succeed on retry
    pub class: DispatchClass,
    /// Human-readable cause
    pub message: String,
}

impl PipelineError {
    /// A transient failure; the dispatcher will retry the batch
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: DispatchClass::Retryable,
            message: message.into(),
        }
    }

    /// A permanent failure; escalates without retry
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: DispatchClass::Fatal,
            message: message.into(),
        }
    }
}

/// Downstream processing pipeline
///
/// Must acknowledge the whole batch or fail it; partial acknowledgement is
/// not expressible, which is what keeps checkpoints honest.
#[async_trait]
pub trait RecordPipeline: Send + Sync {
    /// Process one batch, in shard sequence order
    async fn process(&self, batch: &RecordBatch) -> Result<(), PipelineError>;
}

/// Terminal dispatch failure, after the retry discipline ran its course
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Retryable failures exhausted the configured attempts
    #[error("Dispatch retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: PipelineError },

    /// The pipeline failed the batch permanently
    #[error("Fatal dispatch error: {0}")]
    Fatal(PipelineError),
}

impl DispatchError {
    /// Classification for escalation context
    pub fn class(&self) -> DispatchClass {
        match self {
            DispatchError::Exhausted { .. } => DispatchClass::Retryable,
            DispatchError::Fatal(_) => DispatchClass::Fatal,
        }
    }
}

/// Hands batches to the pipeline and applies the retry policy
pub struct RecordDispatcher {
    pipeline: Arc<dyn RecordPipeline>,
    retry: RetryPolicy,
}

impl RecordDispatcher {
    /// Create a dispatcher over the given pipeline
    pub fn new(pipeline: Arc<dyn RecordPipeline>, retry: RetryPolicy) -> Self {
        Self { pipeline, retry }
    }

    /// Deliver one batch, whole or not at all
    pub async fn dispatch(&self, batch: &RecordBatch) -> Result<(), DispatchError> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.pipeline.process(batch).await {
                Ok(()) => {
                    standard::BATCHES_DISPATCHED.inc();
                    standard::RECORDS_DISPATCHED.inc_by(batch.len() as u64);
                    standard::DISPATCH_DURATION.observe(start.elapsed().as_secs_f64());
                    return Ok(());
                }
                Err(e) if e.class == DispatchClass::Fatal => {
                    return Err(DispatchError::Fatal(e));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(DispatchError::Exhausted { attempts: attempt, last: e });
                    }
                    warn!(
                        "Dispatch attempt {}/{} for shard {} failed: {}",
                        attempt, self.retry.max_attempts, batch.shard_id, e
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}
