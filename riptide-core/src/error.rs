//! Error types for Riptide
//!
//! Comprehensive error taxonomy covering lease store, stream source,
//! dispatch, and worker lifecycle errors.

use thiserror::Error;

use crate::consumer::dispatch::DispatchClass;
use crate::lease::Checkpoint;
use crate::source::ShardId;

/// Primary error type for all Riptide operations
#[derive(Debug, Error)]
pub enum RiptideError {
    // ========== Lease Store Errors ==========

    /// Lease store operation failed after exhausting retries
    #[error("Lease store unavailable after {attempts} attempts: {message}")]
    StoreExhausted { attempts: u32, message: String },

    /// Lease record is corrupt or unreadable
    #[error("Lease record for shard {shard_id} is invalid: {reason}")]
    LeaseInvalid { shard_id: ShardId, reason: String },

    // ========== Stream Source Errors ==========

    /// Stream source operation failed after exhausting retries
    #[error("Stream source unavailable for shard {shard_id} after {attempts} attempts: {message}")]
    SourceExhausted {
        shard_id: ShardId,
        attempts: u32,
        message: String,
    },

    /// Shard discovery failed repeatedly
    #[error("Shard discovery failed after {attempts} attempts: {message}")]
    DiscoveryExhausted { attempts: u32, message: String },

    // ========== Dispatch Errors ==========

    /// Batch dispatch failed terminally for one shard
    #[error(
        "Dispatch failed for shard {shard_id} ({class:?}) at checkpoint {checkpoint}: {message}"
    )]
    DispatchFailed {
        shard_id: ShardId,
        checkpoint: Checkpoint,
        class: DispatchClass,
        message: String,
    },

    // ========== Checkpoint Errors ==========

    /// Attempted checkpoint would move backwards
    #[error("Checkpoint regression for shard {shard_id}: {current} -> {attempted}")]
    CheckpointRegression {
        shard_id: ShardId,
        current: Checkpoint,
        attempted: Checkpoint,
    },

    // ========== Worker Errors ==========

    /// Configuration rejected at construction
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Worker entered a failed state requiring external restart
    #[error("Worker {worker_id} failed: {message}")]
    WorkerFailed { worker_id: String, message: String },

    /// Graceful shutdown exceeded the grace period
    #[error("Shutdown grace period elapsed with {stragglers} consumer task(s) still running")]
    ShutdownTimeout { stragglers: usize },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RiptideError {
    /// Returns true if this error was caused by a transient condition
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RiptideError::StoreExhausted { .. }
                | RiptideError::SourceExhausted { .. }
                | RiptideError::DiscoveryExhausted { .. }
        )
    }

    /// Returns true if this error is fatal for the whole worker rather
    /// than a single shard
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            RiptideError::StoreExhausted { .. }
                | RiptideError::DiscoveryExhausted { .. }
                | RiptideError::WorkerFailed { .. }
        )
    }
}

/// Result type alias for Riptide operations
pub type Result<T> = std::result::Result<T, RiptideError>;
