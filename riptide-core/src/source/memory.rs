//! In-memory stream source
//!
//! Backs tests and local development. Records get globally increasing
//! sequence numbers; shards can be closed and split to exercise resharding
//! paths.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use async_trait::async_trait;

use super::types::{
    ReadPosition, Record, RecordPoll, SequenceNumber, Shard, ShardId, SourceError,
};
use super::StreamSource;

struct ShardData {
    shard: Shard,
    records: Vec<Record>,
}

struct Inner {
    shards: BTreeMap<ShardId, ShardData>,
    next_sequence: u64,
}

/// In-memory implementation of [`StreamSource`]
pub struct InMemoryStreamSource {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStreamSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamSource {
    /// Create an empty stream
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                shards: BTreeMap::new(),
                next_sequence: 1,
            }),
        }
    }

    /// Add an open shard with no parents
    pub fn create_shard(&self, shard_id: impl Into<String>) -> ShardId {
        self.create_shard_with_parents(shard_id, Vec::new())
    }

    /// Add an open shard with the given parents
    pub fn create_shard_with_parents(
        &self,
        shard_id: impl Into<String>,
        parents: Vec<ShardId>,
    ) -> ShardId {
        let mut inner = self.inner.lock();
        let starting = SequenceNumber::new(inner.next_sequence.to_string());
        let shard =
            Shard::new(shard_id, starting).with_parents(parents);
        let id = shard.shard_id.clone();
        inner.shards.insert(
            id.clone(),
            ShardData {
                shard,
                records: Vec::new(),
            },
        );
        id
    }

    /// Append records to a shard, returning their sequence numbers
    pub fn push_records(
        &self,
        shard_id: &ShardId,
        payloads: Vec<(&str, Bytes)>,
    ) -> Vec<SequenceNumber> {
        let mut inner = self.inner.lock();
        let mut assigned = Vec::with_capacity(payloads.len());
        for (partition_key, data) in payloads {
            let seq = SequenceNumber::new(inner.next_sequence.to_string());
            inner.next_sequence += 1;
            assigned.push(seq.clone());
            let entry = inner
                .shards
                .get_mut(shard_id)
                .expect("push_records on unknown shard");
            entry.records.push(Record {
                sequence_number: seq,
                partition_key: partition_key.to_string(),
                data,
                approximate_arrival: Utc::now(),
            });
        }
        assigned
    }

    /// Close a shard; no further records can be appended
    pub fn close_shard(&self, shard_id: &ShardId) {
        let mut inner = self.inner.lock();
        let entry = inner
            .shards
            .get_mut(shard_id)
            .expect("close_shard on unknown shard");
        let ending = entry
            .records
            .last()
            .map(|r| r.sequence_number.clone())
            .unwrap_or_else(|| entry.shard.starting_sequence.clone());
        entry.shard.ending_sequence = Some(ending);
    }

    /// Close a shard and create two children parented to it
    pub fn split_shard(
        &self,
        parent: &ShardId,
        child_a: impl Into<String>,
        child_b: impl Into<String>,
    ) -> (ShardId, ShardId) {
        self.close_shard(parent);
        let a = self.create_shard_with_parents(child_a, vec![parent.clone()]);
        let b = self.create_shard_with_parents(child_b, vec![parent.clone()]);
        (a, b)
    }

    fn start_index(records: &[Record], position: &ReadPosition) -> usize {
        match position {
            ReadPosition::TrimHorizon => 0,
            ReadPosition::Latest => records.len(),
            ReadPosition::AtTimestamp(ts) => records
                .iter()
                .position(|r| r.approximate_arrival >= *ts)
                .unwrap_or(records.len()),
            ReadPosition::AfterSequence(seq) => records
                .iter()
                .position(|r| r.sequence_number > *seq)
                .unwrap_or(records.len()),
        }
    }
}

#[async_trait]
impl StreamSource for InMemoryStreamSource {
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError> {
        let inner = self.inner.lock();
        Ok(inner.shards.values().map(|d| d.shard.clone()).collect())
    }

    async fn get_records(
        &self,
        shard_id: &ShardId,
        position: &ReadPosition,
        limit: usize,
    ) -> Result<RecordPoll, SourceError> {
        let inner = self.inner.lock();
        let data = inner.shards.get(shard_id).ok_or_else(|| {
            SourceError::UnknownShard {
                shard_id: shard_id.clone(),
            }
        })?;

        let start = Self::start_index(&data.records, position);
        let records: Vec<Record> = data.records[start..]
            .iter()
            .take(limit)
            .cloned()
            .collect();

        let next_position = match records.last() {
            Some(last) => ReadPosition::AfterSequence(last.sequence_number.clone()),
            None => match position {
                // Latest pins to the current tip so later polls see only
                // new records
                ReadPosition::Latest => data
                    .records
                    .last()
                    .map(|r| ReadPosition::AfterSequence(r.sequence_number.clone()))
                    .unwrap_or(ReadPosition::Latest),
                other => other.clone(),
            },
        };

        let consumed = start + records.len();
        let end_of_shard = data.shard.is_closed() && consumed >= data.records.len();

        let millis_behind = data
            .records
            .last()
            .map(|tip| {
                let behind = match records.last() {
                    Some(last) => tip.approximate_arrival - last.approximate_arrival,
                    None => chrono::Duration::zero(),
                };
                behind.num_milliseconds().max(0) as u64
            })
            .or(Some(0));

        Ok(RecordPoll {
            records,
            next_position,
            end_of_shard,
            millis_behind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> Vec<(&'static str, Bytes)> {
        (0..n).map(|_| ("pk", Bytes::from_static(b"x"))).collect()
    }

    #[tokio::test]
    async fn test_trim_horizon_reads_from_start() {
        let source = InMemoryStreamSource::new();
        let shard = source.create_shard("shard-0001");
        let seqs = source.push_records(&shard, payload(3));

        let poll = source
            .get_records(&shard, &ReadPosition::TrimHorizon, 10)
            .await
            .unwrap();
        assert_eq!(poll.records.len(), 3);
        assert_eq!(poll.records[0].sequence_number, seqs[0]);
        assert!(!poll.end_of_shard);
    }

    #[tokio::test]
    async fn test_after_sequence_resumes() {
        let source = InMemoryStreamSource::new();
        let shard = source.create_shard("shard-0001");
        let seqs = source.push_records(&shard, payload(5));

        let poll = source
            .get_records(&shard, &ReadPosition::AfterSequence(seqs[1].clone()), 2)
            .await
            .unwrap();
        assert_eq!(poll.records.len(), 2);
        assert_eq!(poll.records[0].sequence_number, seqs[2]);
        assert_eq!(
            poll.next_position,
            ReadPosition::AfterSequence(seqs[3].clone())
        );
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let source = InMemoryStreamSource::new();
        let shard = source.create_shard("shard-0001");
        source.push_records(&shard, payload(3));

        let poll = source
            .get_records(&shard, &ReadPosition::Latest, 10)
            .await
            .unwrap();
        assert!(poll.records.is_empty());

        let new_seqs = source.push_records(&shard, payload(1));
        let poll = source
            .get_records(&shard, &poll.next_position, 10)
            .await
            .unwrap();
        assert_eq!(poll.records.len(), 1);
        assert_eq!(poll.records[0].sequence_number, new_seqs[0]);
    }

    #[tokio::test]
    async fn test_closed_shard_reports_end() {
        let source = InMemoryStreamSource::new();
        let shard = source.create_shard("shard-0001");
        source.push_records(&shard, payload(2));
        source.close_shard(&shard);

        let poll = source
            .get_records(&shard, &ReadPosition::TrimHorizon, 10)
            .await
            .unwrap();
        assert_eq!(poll.records.len(), 2);
        assert!(poll.end_of_shard);
    }

    #[tokio::test]
    async fn test_unknown_shard_errors() {
        let source = InMemoryStreamSource::new();
        let err = source
            .get_records(&ShardId::new("shard-0404"), &ReadPosition::TrimHorizon, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::UnknownShard { .. }));
    }
}
