//! Shard discovery and lease table synchronization
//!
//! Each coordination cycle the discovery pass lists the stream's shards and
//! makes the lease table match: new shards get leases, children stay gated
//! until every parent has been consumed to SHARD_END, and fully-retired
//! parents are deleted.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::InitialPosition;
use crate::error::{Result, RiptideError};
use crate::lease::{Checkpoint, Lease, LeaseStore, StoreError};
use crate::retry::RetryPolicy;
use crate::source::{Shard, ShardId, StreamSource};

impl From<&InitialPosition> for Checkpoint {
    fn from(position: &InitialPosition) -> Checkpoint {
        match position {
            InitialPosition::Latest => Checkpoint::Latest,
            InitialPosition::TrimHorizon => Checkpoint::TrimHorizon,
            InitialPosition::AtTimestamp(ts) => Checkpoint::AtTimestamp(*ts),
        }
    }
}

/// What one discovery pass changed
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Shards that got a fresh lease this pass
    pub created: Vec<ShardId>,
    /// Parent shards whose leases were retired this pass
    pub retired: Vec<ShardId>,
}

/// Keeps the lease table in sync with the stream's shard topology
pub struct ShardDiscovery {
    source: Arc<dyn StreamSource>,
    store: Arc<dyn LeaseStore>,
    initial_position: InitialPosition,
    retry: RetryPolicy,
}

impl ShardDiscovery {
    /// Create a discovery pass over the given source and lease store
    pub fn new(
        source: Arc<dyn StreamSource>,
        store: Arc<dyn LeaseStore>,
        initial_position: InitialPosition,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            store,
            initial_position,
            retry,
        }
    }

    /// Run one discovery pass
    pub async fn refresh(&self) -> Result<DiscoveryReport> {
        let shards = self.list_shards_with_retry().await?;
        let leases = self.list_leases_with_retry().await?;

        let mut lease_by_shard: HashMap<ShardId, Lease> = leases
            .into_iter()
            .map(|l| (l.shard_id.clone(), l))
            .collect();
        let shard_by_id: HashMap<&ShardId, &Shard> =
            shards.iter().map(|s| (&s.shard_id, s)).collect();

        // First-ever discovery: the configured initial position applies.
        // Afterwards new shards are children from resharding and must start
        // at the horizon so no records are skipped.
        let first_wave = lease_by_shard.is_empty();

        let mut report = DiscoveryReport::default();

        let mut pending: Vec<&Shard> = shards
            .iter()
            .filter(|s| !lease_by_shard.contains_key(&s.shard_id))
            .collect();
        pending.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        for shard in pending {
            if !self.parents_consumed(shard, &lease_by_shard, &shard_by_id) {
                debug!(
                    "Holding lease creation for shard {}: parents not at SHARD_END",
                    shard.shard_id
                );
                continue;
            }

            let checkpoint = if first_wave {
                Checkpoint::from(&self.initial_position)
            } else {
                Checkpoint::TrimHorizon
            };
            let lease = Lease::new(
                shard.shard_id.clone(),
                checkpoint,
                shard.parent_shard_ids.clone(),
            );

            if self.create_with_retry(lease.clone()).await? {
                info!("Created lease for newly discovered shard {}", shard.shard_id);
                report.created.push(shard.shard_id.clone());
                lease_by_shard.insert(shard.shard_id.clone(), lease);
            }
        }

        report.retired = self.retire_parents(&shards, &lease_by_shard).await?;
        Ok(report)
    }

    /// A shard may get a lease only once every parent still known to the
    /// stream has a lease checkpointed at SHARD_END. Parents absent from
    /// both the shard list and the lease table were already retired.
    fn parents_consumed(
        &self,
        shard: &Shard,
        leases: &HashMap<ShardId, Lease>,
        shards: &HashMap<&ShardId, &Shard>,
    ) -> bool {
        shard.parent_shard_ids.iter().all(|parent| {
            match leases.get(parent) {
                Some(lease) => lease.checkpoint == Checkpoint::ShardEnd,
                None => !shards.contains_key(parent),
            }
        })
    }

    /// Delete leases of parents consumed to SHARD_END once every child has
    /// its own lease
    async fn retire_parents(
        &self,
        shards: &[Shard],
        leases: &HashMap<ShardId, Lease>,
    ) -> Result<Vec<ShardId>> {
        let mut children_of: HashMap<&ShardId, Vec<&ShardId>> = HashMap::new();
        for shard in shards {
            for parent in &shard.parent_shard_ids {
                children_of.entry(parent).or_default().push(&shard.shard_id);
            }
        }

        let mut retired = Vec::new();
        for (shard_id, lease) in leases {
            if lease.checkpoint != Checkpoint::ShardEnd {
                continue;
            }
            let children = match children_of.get(shard_id) {
                Some(children) if !children.is_empty() => children,
                _ => continue,
            };
            if !children.iter().all(|c| leases.contains_key(*c)) {
                continue;
            }

            self.delete_with_retry(shard_id).await?;
            info!("Retired lease for fully consumed shard {}", shard_id);
            retired.push(shard_id.clone());
        }
        retired.sort();
        Ok(retired)
    }

    async fn list_shards_with_retry(&self) -> Result<Vec<Shard>> {
        let mut attempt = 0;
        loop {
            match self.source.list_shards().await {
                Ok(shards) => return Ok(shards),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    warn!(
                        "Shard listing attempt {}/{} failed: {}",
                        attempt + 1,
                        self.retry.max_attempts,
                        e
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RiptideError::DiscoveryExhausted {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn list_leases_with_retry(&self) -> Result<Vec<Lease>> {
        let mut attempt = 0;
        loop {
            match self.store.list().await {
                Ok(leases) => return Ok(leases),
                Err(e) => self.store_backoff_or_bail(&e, &mut attempt).await?,
            }
        }
    }

    async fn create_with_retry(&self, lease: Lease) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.store.create(lease.clone()).await {
                Ok(created) => return Ok(created),
                Err(e) => self.store_backoff_or_bail(&e, &mut attempt).await?,
            }
        }
    }

    async fn delete_with_retry(&self, shard_id: &ShardId) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.delete(shard_id).await {
                Ok(()) => return Ok(()),
                Err(e) => self.store_backoff_or_bail(&e, &mut attempt).await?,
            }
        }
    }

    async fn store_backoff_or_bail(&self, error: &StoreError, attempt: &mut u32) -> Result<()> {
        if !error.is_retryable() || *attempt + 1 >= self.retry.max_attempts {
            return Err(RiptideError::StoreExhausted {
                attempts: *attempt + 1,
                message: error.to_string(),
            });
        }
        tokio::time::sleep(self.retry.delay_for(*attempt)).await;
        *attempt += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::InMemoryLeaseStore;
    use crate::source::memory::InMemoryStreamSource;
    use bytes::Bytes;

    fn discovery(
        source: &Arc<InMemoryStreamSource>,
        store: &Arc<InMemoryLeaseStore>,
        position: InitialPosition,
    ) -> ShardDiscovery {
        ShardDiscovery::new(
            source.clone() as Arc<dyn StreamSource>,
            store.clone() as Arc<dyn LeaseStore>,
            position,
            RetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_first_wave_uses_initial_position() {
        let source = Arc::new(InMemoryStreamSource::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        source.create_shard("shard-0001");
        source.create_shard("shard-0002");

        let d = discovery(&source, &store, InitialPosition::Latest);
        let report = d.refresh().await.unwrap();
        assert_eq!(report.created.len(), 2);

        for lease in store.list().await.unwrap() {
            assert_eq!(lease.checkpoint, Checkpoint::Latest);
        }
    }

    #[tokio::test]
    async fn test_child_gated_until_parent_at_shard_end() {
        let source = Arc::new(InMemoryStreamSource::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        let parent = source.create_shard("shard-0001");
        source.push_records(&parent, vec![("pk", Bytes::from_static(b"x"))]);

        let d = discovery(&source, &store, InitialPosition::TrimHorizon);
        d.refresh().await.unwrap();

        // Resharding happens after the first wave
        source.split_shard(&parent, "shard-0002", "shard-0003");
        let report = d.refresh().await.unwrap();
        assert!(report.created.is_empty());

        // Parent consumed to the end: children become eligible
        let mut parent_lease = store.get(&parent).await.unwrap().unwrap();
        let expected = parent_lease.counter;
        parent_lease.checkpoint = Checkpoint::ShardEnd;
        parent_lease.counter += 1;
        assert!(store.put_conditional(expected, parent_lease).await.unwrap());

        let report = d.refresh().await.unwrap();
        assert_eq!(
            report.created,
            vec![ShardId::new("shard-0002"), ShardId::new("shard-0003")]
        );

        // Children from resharding start at the horizon, not Latest
        let child = store
            .get(&ShardId::new("shard-0002"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.checkpoint, Checkpoint::TrimHorizon);
        assert_eq!(child.parent_shard_ids, vec![parent.clone()]);

        // And the parent lease is retired in the same pass
        assert_eq!(report.retired, vec![parent.clone()]);
        assert!(store.get(&parent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let source = Arc::new(InMemoryStreamSource::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        source.create_shard("shard-0001");

        let d = discovery(&source, &store, InitialPosition::TrimHorizon);
        assert_eq!(d.refresh().await.unwrap().created.len(), 1);
        assert!(d.refresh().await.unwrap().created.is_empty());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
