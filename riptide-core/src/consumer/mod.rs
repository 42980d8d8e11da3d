//! Shard consumption
//!
//! One consumer task per leased shard, plus the dispatcher that hands
//! batches to the downstream pipeline with retry and failure
//! classification.

pub mod dispatch;
pub mod shard;

pub use dispatch::{
    DispatchClass, DispatchError, PipelineError, RecordDispatcher, RecordPipeline,
};
pub use shard::{ConsumerOutcome, ConsumerState, ShardConsumer};
