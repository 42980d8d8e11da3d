//! Lease and checkpoint records
//!
//! The lease is the durable ownership + progress record for one shard. The
//! checkpoint is persisted inside it as a sentinel string or a raw sequence
//! number, matching the lease-table column format.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::source::{SequenceNumber, ShardId};

/// Sentinel string forms stored in the lease table
const TRIM_HORIZON: &str = "TRIM_HORIZON";
const LATEST: &str = "LATEST";
const AT_TIMESTAMP_PREFIX: &str = "AT_TIMESTAMP:";
const SHARD_END: &str = "SHARD_END";

/// A position within a shard's record sequence
///
/// Only moves forward once it is a concrete sequence number; `ShardEnd` is
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Checkpoint {
    /// No record consumed yet; start at the oldest retained record
    TrimHorizon,
    /// No record consumed yet; start at the stream tip
    Latest,
    /// No record consumed yet; start at the given timestamp
    AtTimestamp(chrono::DateTime<Utc>),
    /// Last fully-processed record
    SequenceNumber(SequenceNumber),
    /// Shard fully consumed and closed
    ShardEnd,
}

impl Checkpoint {
    /// Whether this checkpoint is still an initial-position sentinel
    /// (no record has been committed yet)
    pub fn is_sentinel(&self) -> bool {
        !matches!(
            self,
            Checkpoint::SequenceNumber(_) | Checkpoint::ShardEnd
        )
    }

    /// Monotonicity rule for checkpoint commits
    ///
    /// Sentinels may advance to any concrete position; sequence numbers only
    /// move forward or to `ShardEnd`; nothing leaves `ShardEnd`.
    pub fn can_advance_to(&self, next: &Checkpoint) -> bool {
        match (self, next) {
            (Checkpoint::ShardEnd, _) => false,
            (_, Checkpoint::ShardEnd) => true,
            (_, next) if next.is_sentinel() => false,
            (Checkpoint::SequenceNumber(cur), Checkpoint::SequenceNumber(nxt)) => nxt >= cur,
            // Sentinel -> first concrete sequence number
            (_, Checkpoint::SequenceNumber(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::TrimHorizon => f.write_str(TRIM_HORIZON),
            Checkpoint::Latest => f.write_str(LATEST),
            Checkpoint::AtTimestamp(ts) => {
                write!(f, "{}{}", AT_TIMESTAMP_PREFIX, ts.to_rfc3339())
            }
            Checkpoint::SequenceNumber(seq) => f.write_str(seq.as_str()),
            Checkpoint::ShardEnd => f.write_str(SHARD_END),
        }
    }
}

impl From<Checkpoint> for String {
    fn from(cp: Checkpoint) -> String {
        cp.to_string()
    }
}

impl TryFrom<String> for Checkpoint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            TRIM_HORIZON => Ok(Checkpoint::TrimHorizon),
            LATEST => Ok(Checkpoint::Latest),
            SHARD_END => Ok(Checkpoint::ShardEnd),
            other => {
                if let Some(ts) = other.strip_prefix(AT_TIMESTAMP_PREFIX) {
                    let parsed = chrono::DateTime::parse_from_rfc3339(ts)
                        .map_err(|e| format!("Bad AT_TIMESTAMP checkpoint {:?}: {}", other, e))?;
                    return Ok(Checkpoint::AtTimestamp(parsed.with_timezone(&Utc)));
                }
                if other.is_empty() || !other.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("Bad checkpoint value: {:?}", other));
                }
                Ok(Checkpoint::SequenceNumber(SequenceNumber::new(other)))
            }
        }
    }
}

/// Durable ownership + progress record for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Shard this lease covers (table key)
    pub shard_id: ShardId,
    /// Current owner's worker identity, if any
    pub owner: Option<String>,
    /// Optimistic-concurrency token, incremented on every successful
    /// mutation
    pub counter: u64,
    /// Last fully-processed position
    pub checkpoint: Checkpoint,
    /// Parent shards; a consumer for this shard must not start until every
    /// parent lease has reached `ShardEnd`
    pub parent_shard_ids: Vec<ShardId>,
    /// Wall-clock time of the last successful mutation, epoch millis
    pub last_renewal_epoch_ms: i64,
}

impl Lease {
    /// Create an unowned lease with the given starting checkpoint
    pub fn new(shard_id: ShardId, checkpoint: Checkpoint, parent_shard_ids: Vec<ShardId>) -> Self {
        Self {
            shard_id,
            owner: None,
            counter: 0,
            checkpoint,
            parent_shard_ids,
            last_renewal_epoch_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Whether the lease has gone unrenewed for longer than the lease
    /// duration, as observed on this worker's clock
    pub fn is_expired(&self, lease_duration: Duration) -> bool {
        let age_ms = Utc::now().timestamp_millis() - self.last_renewal_epoch_ms;
        age_ms > lease_duration.as_millis() as i64
    }

    /// Whether the lease is up for grabs: no owner, or owner expired
    pub fn is_available(&self, lease_duration: Duration) -> bool {
        self.owner.is_none() || self.is_expired(lease_duration)
    }

    /// Copy with ownership taken by `owner` and the counter bumped
    pub(crate) fn taken_by(&self, owner: &str) -> Lease {
        let mut next = self.clone();
        next.owner = Some(owner.to_string());
        next.counter += 1;
        next.last_renewal_epoch_ms = Utc::now().timestamp_millis();
        next
    }
}
