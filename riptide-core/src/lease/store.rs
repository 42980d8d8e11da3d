//! Lease store interface and in-memory implementation
//!
//! The store is a durable key-value table of shard-id to lease record. Its
//! consistency contract is load-bearing: every mutation is a strict
//! conditional write on the lease counter, so two workers can never both
//! believe they own the same shard.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::types::Lease;
use crate::source::ShardId;

/// Errors surfaced by a lease store implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable or internal fault; retryable
    #[error("Lease store unavailable: {message}")]
    Unavailable { message: String },

    /// Request rate exceeded; retryable after backoff
    #[error("Lease store throttled")]
    Throttled,

    /// Stored record could not be decoded
    #[error("Corrupt lease record for shard {shard_id}: {reason}")]
    Corrupt { shard_id: ShardId, reason: String },
}

impl StoreError {
    /// Returns true if the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Throttled
        )
    }
}

/// Durable lease table
///
/// `put_conditional` must compare the stored counter against
/// `expected_counter` and reject the write on mismatch, atomically. That
/// compare-and-swap is the only mutual-exclusion mechanism in the system.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read one lease
    async fn get(&self, shard_id: &ShardId) -> Result<Option<Lease>, StoreError>;

    /// Snapshot of all leases
    async fn list(&self) -> Result<Vec<Lease>, StoreError>;

    /// Create a lease if none exists for the shard; returns false when one
    /// already does
    async fn create(&self, lease: Lease) -> Result<bool, StoreError>;

    /// Conditionally replace a lease; returns false when the stored counter
    /// does not equal `expected_counter` (someone else mutated it)
    async fn put_conditional(
        &self,
        expected_counter: u64,
        lease: Lease,
    ) -> Result<bool, StoreError>;

    /// Delete a lease (shard retirement only)
    async fn delete(&self, shard_id: &ShardId) -> Result<(), StoreError>;
}

/// In-memory lease store for tests and local development
///
/// Serializes every record through the same serde path a durable backend
/// would use, so format regressions show up here too.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    table: Mutex<HashMap<ShardId, String>>,
}

impl InMemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(shard_id: &ShardId, raw: &str) -> Result<Lease, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            shard_id: shard_id.clone(),
            reason: e.to_string(),
        })
    }

    fn encode(lease: &Lease) -> String {
        // Lease serialization is infallible: all fields are plain data
        serde_json::to_string(lease).expect("lease serializes")
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, shard_id: &ShardId) -> Result<Option<Lease>, StoreError> {
        let table = self.table.lock();
        table
            .get(shard_id)
            .map(|raw| Self::decode(shard_id, raw))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Lease>, StoreError> {
        let table = self.table.lock();
        let mut leases = Vec::with_capacity(table.len());
        for (shard_id, raw) in table.iter() {
            leases.push(Self::decode(shard_id, raw)?);
        }
        leases.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        Ok(leases)
    }

    async fn create(&self, lease: Lease) -> Result<bool, StoreError> {
        let mut table = self.table.lock();
        if table.contains_key(&lease.shard_id) {
            return Ok(false);
        }
        table.insert(lease.shard_id.clone(), Self::encode(&lease));
        Ok(true)
    }

    async fn put_conditional(
        &self,
        expected_counter: u64,
        lease: Lease,
    ) -> Result<bool, StoreError> {
        let mut table = self.table.lock();
        let current = match table.get(&lease.shard_id) {
            Some(raw) => Self::decode(&lease.shard_id, raw)?,
            None => return Ok(false),
        };
        if current.counter != expected_counter {
            return Ok(false);
        }
        table.insert(lease.shard_id.clone(), Self::encode(&lease));
        Ok(true)
    }

    async fn delete(&self, shard_id: &ShardId) -> Result<(), StoreError> {
        self.table.lock().remove(shard_id);
        Ok(())
    }
}
