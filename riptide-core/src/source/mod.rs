//! Stream source interface
//!
//! The source is an external collaborator: anything that can enumerate
//! shards and serve ordered records per shard. Implementations are
//! constructor-injected so tests substitute fakes without subclassing.

pub mod discovery;
pub mod memory;
mod types;

pub use types::{
    ReadPosition, Record, RecordBatch, RecordPoll, SequenceNumber, Shard, ShardId, SourceError,
};

use async_trait::async_trait;

/// A partitioned, shard-based streaming data source
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Enumerate all shards of the stream, including closed parents
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError>;

    /// Read up to `limit` records from a shard at the given position
    async fn get_records(
        &self,
        shard_id: &ShardId,
        position: &ReadPosition,
        limit: usize,
    ) -> Result<RecordPoll, SourceError>;
}
