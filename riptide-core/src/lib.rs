//! Riptide Core - Lease-coordinated shard stream consumption
//!
//! This crate provides the runtime for reliably consuming a partitioned,
//! shard-based stream across multiple worker processes:
//! - Shard discovery and resharding lineage
//! - Durable per-shard leases with optimistic-concurrency ownership
//! - Checkpointing with at-least-once delivery
//! - Worker lifecycle and graceful shutdown

pub mod config;
pub mod consumer;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod worker;

pub use config::{ConsumerConfig, InitialPosition};
pub use consumer::{PipelineError, RecordPipeline};
pub use error::RiptideError;
pub use lease::{Checkpoint, Lease, LeaseStore};
pub use source::{Record, RecordBatch, Shard, ShardId, StreamSource};
pub use worker::{ShutdownReport, Worker, WorkerPhase};

/// Default lease duration in seconds
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 30;

/// Default lease renewal interval in seconds
pub const DEFAULT_RENEWAL_INTERVAL_SECS: u64 = 10;

/// Default checkpoint interval in seconds
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 60;
