//! Stream source data types
//!
//! Shards, sequence numbers, records, and read positions.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one shard within the stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Position of a record within a shard's sequence
///
/// Sequence numbers are decimal strings without leading zeros, so ordering
/// by (length, bytes) matches numeric ordering without bignum parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    /// Create a sequence number from its decimal string form
    pub fn new(seq: impl Into<String>) -> Self {
        Self(seq.into())
    }

    /// The raw decimal string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.len(), self.0.as_bytes()).cmp(&(other.0.len(), other.0.as_bytes()))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A shard of the stream as reported by the source
///
/// Immutable once discovered. A populated `ending_sequence` means the shard
/// is closed and will produce no records past it; its children carry on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    /// Shard identifier
    pub shard_id: ShardId,
    /// Parent shards from resharding, 0-2 entries (split has one parent,
    /// merge has two)
    pub parent_shard_ids: Vec<ShardId>,
    /// First sequence number in the shard
    pub starting_sequence: SequenceNumber,
    /// Last sequence number, present only when the shard is closed
    pub ending_sequence: Option<SequenceNumber>,
}

impl Shard {
    /// Create an open shard with no parents
    pub fn new(shard_id: impl Into<String>, starting_sequence: SequenceNumber) -> Self {
        Self {
            shard_id: ShardId::new(shard_id),
            parent_shard_ids: Vec::new(),
            starting_sequence,
            ending_sequence: None,
        }
    }

    /// Set parent shards
    pub fn with_parents(mut self, parents: Vec<ShardId>) -> Self {
        self.parent_shard_ids = parents;
        self
    }

    /// Whether the shard is closed (fully written, children may exist)
    pub fn is_closed(&self) -> bool {
        self.ending_sequence.is_some()
    }
}

/// A single record pulled from a shard
#[derive(Debug, Clone)]
pub struct Record {
    /// Position within the shard
    pub sequence_number: SequenceNumber,
    /// Partition key the producer wrote the record with
    pub partition_key: String,
    /// Opaque payload (zero-copy Bytes)
    pub data: Bytes,
    /// Approximate server-side arrival time
    pub approximate_arrival: DateTime<Utc>,
}

/// An ordered batch of records from one poll cycle
///
/// Owned exclusively by the consumer task that pulled it until dispatched.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    /// Shard the records came from
    pub shard_id: ShardId,
    /// Records in shard sequence order
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Sequence number of the last record in the batch
    pub fn last_sequence(&self) -> Option<&SequenceNumber> {
        self.records.last().map(|r| &r.sequence_number)
    }

    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch carries no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Where to start reading a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPosition {
    /// Oldest retained record
    TrimHorizon,
    /// Only records written after the iterator is obtained
    Latest,
    /// First record at or after the timestamp
    AtTimestamp(DateTime<Utc>),
    /// First record strictly after the given sequence number
    AfterSequence(SequenceNumber),
}

/// Result of one `get_records` poll
#[derive(Debug, Clone)]
pub struct RecordPoll {
    /// Records read, possibly empty
    pub records: Vec<Record>,
    /// Position to resume the next poll from
    pub next_position: ReadPosition,
    /// True once the shard is closed and fully read
    pub end_of_shard: bool,
    /// How far behind the shard tip this read was, if the source knows
    pub millis_behind: Option<u64>,
}

/// Errors surfaced by a stream source implementation
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Source unreachable or internal fault; retryable
    #[error("Stream source unavailable: {message}")]
    Unavailable { message: String },

    /// Read rate exceeded; retryable after backoff
    #[error("Stream source throttled")]
    Throttled,

    /// The shard does not exist in this stream
    #[error("Unknown shard: {shard_id}")]
    UnknownShard { shard_id: ShardId },

    /// Position no longer valid for the shard (e.g. trimmed past it)
    #[error("Invalid read position for shard {shard_id}: {reason}")]
    InvalidPosition { shard_id: ShardId, reason: String },
}

impl SourceError {
    /// Returns true if the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Unavailable { .. } | SourceError::Throttled
        )
    }
}
