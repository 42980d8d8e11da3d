//! Lease coordinator
//!
//! Acquires, renews, and releases shard leases for one worker. Every
//! mutation is a conditional write on the lease counter; losing a race is a
//! normal outcome, not an error. Ownership loss is signalled to the
//! affected shard consumer through a per-lease watch channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::store::{LeaseStore, StoreError};
use super::types::{Checkpoint, Lease};
use crate::config::ConsumerConfig;
use crate::error::{Result, RiptideError};
use crate::metrics::standard;
use crate::retry::RetryPolicy;
use crate::source::ShardId;

/// Result of one acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Lease taken; a consumer task should be started
    Acquired,
    /// Another worker got there first, or the lease is not available
    NotAcquired,
}

/// Result of a checkpoint commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Checkpoint persisted
    Committed,
    /// The lease was stolen underneath us; the consumer must stop
    OwnershipLost,
}

/// A lease currently held by this worker
struct HeldLease {
    lease: Lease,
    owned_tx: watch::Sender<bool>,
}

/// Coordinates lease ownership for one worker process
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    worker_id: String,
    lease_duration: Duration,
    max_acquires_per_cycle: usize,
    store_retry: RetryPolicy,
    held: RwLock<HashMap<ShardId, HeldLease>>,
    /// Shards this worker failed on; excluded from re-acquisition so a
    /// failed shard is never restarted locally
    quarantined: RwLock<HashSet<ShardId>>,
}

impl LeaseCoordinator {
    /// Create a coordinator for the given worker identity
    pub fn new(store: Arc<dyn LeaseStore>, worker_id: String, config: &ConsumerConfig) -> Self {
        Self {
            store,
            worker_id,
            lease_duration: config.lease_duration,
            max_acquires_per_cycle: config.max_acquires_per_cycle,
            store_retry: config.store_retry.clone(),
            held: RwLock::new(HashMap::new()),
            quarantined: RwLock::new(HashSet::new()),
        }
    }

    /// This worker's identity, used as the lease owner field
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Snapshot of all leases in the store
    pub async fn list_leases(&self) -> Result<Vec<Lease>> {
        let mut attempt = 0;
        loop {
            match self.store.list().await {
                Ok(leases) => return Ok(leases),
                Err(e) => self.backoff_or_bail("list", &e, &mut attempt).await?,
            }
        }
    }

    /// Attempt to take one available lease
    ///
    /// Succeeds only when the lease is unowned or its owner has expired, and
    /// the conditional write wins. Losing is not an error.
    pub async fn acquire(&self, lease: &Lease) -> Result<AcquireOutcome> {
        if !lease.is_available(self.lease_duration) {
            return Ok(AcquireOutcome::NotAcquired);
        }

        let taken = lease.taken_by(&self.worker_id);
        if !self.put_with_retry(lease.counter, taken.clone()).await? {
            debug!("Lost acquire race for shard {}", lease.shard_id);
            return Ok(AcquireOutcome::NotAcquired);
        }

        let stolen = lease.owner.is_some();
        if stolen {
            info!(
                "Stole expired lease for shard {} from {}",
                lease.shard_id,
                lease.owner.as_deref().unwrap_or("?")
            );
            standard::LEASES_STOLEN.inc();
        } else {
            info!("Acquired lease for shard {}", lease.shard_id);
        }
        standard::LEASES_ACQUIRED.inc();

        let (owned_tx, _) = watch::channel(true);
        let mut held = self.held.write().await;
        held.insert(
            taken.shard_id.clone(),
            HeldLease {
                lease: taken,
                owned_tx,
            },
        );
        standard::LEASES_HELD.set(held.len() as i64);

        Ok(AcquireOutcome::Acquired)
    }

    /// One coordination round: list leases and acquire a bounded, balanced
    /// number of the available ones
    ///
    /// Fair share is ceil(total / live owners including self); acquisitions
    /// per round are additionally bounded by the configured maximum.
    /// Candidates are taken in shard-id order so rounds are deterministic.
    pub async fn take_cycle(&self) -> Result<Vec<ShardId>> {
        let leases = self.list_leases().await?;
        if leases.is_empty() {
            return Ok(Vec::new());
        }

        let held_count = self.held.read().await.len();

        let mut owners: HashSet<&str> = leases
            .iter()
            .filter(|l| !l.is_available(self.lease_duration))
            .filter_map(|l| l.owner.as_deref())
            .collect();
        owners.insert(self.worker_id.as_str());

        let fair_share = (leases.len() + owners.len() - 1) / owners.len();
        let budget = fair_share
            .saturating_sub(held_count)
            .min(self.max_acquires_per_cycle);
        if budget == 0 {
            return Ok(Vec::new());
        }

        let held = self.held.read().await;
        let quarantined = self.quarantined.read().await;
        let mut candidates: Vec<&Lease> = leases
            .iter()
            .filter(|l| {
                l.is_available(self.lease_duration)
                    && !held.contains_key(&l.shard_id)
                    && !quarantined.contains(&l.shard_id)
            })
            .collect();
        drop(held);
        drop(quarantined);
        candidates.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        let mut acquired = Vec::new();
        for lease in candidates.into_iter().take(budget) {
            if self.acquire(lease).await? == AcquireOutcome::Acquired {
                acquired.push(lease.shard_id.clone());
            }
        }
        Ok(acquired)
    }

    /// Renew every held lease, bumping its counter
    ///
    /// Returns the shards whose leases were stolen underneath us; their
    /// consumers have already been signalled to stop.
    pub async fn renew_all(&self) -> Result<Vec<ShardId>> {
        let snapshot: Vec<Lease> = {
            let held = self.held.read().await;
            held.values().map(|h| h.lease.clone()).collect()
        };

        let mut lost = Vec::new();
        for current in snapshot {
            let renewed = current.taken_by(&self.worker_id);
            if self.put_with_retry(current.counter, renewed.clone()).await? {
                let mut held = self.held.write().await;
                if let Some(entry) = held.get_mut(&current.shard_id) {
                    entry.lease = renewed;
                }
                continue;
            }
            // The conditional write lost. A concurrent local checkpoint
            // commit also bumps the counter (and refreshes the renewal
            // time), so check the store before declaring the lease stolen.
            if self.held_lease(&current.shard_id).await.is_none() {
                // Released or evicted since the snapshot
                continue;
            }
            match self.get_with_retry(&current.shard_id).await? {
                Some(stored) if stored.owner.as_deref() == Some(self.worker_id.as_str()) => {
                    // Our own commit renewed it; sync the held copy
                    let mut held = self.held.write().await;
                    if let Some(entry) = held.get_mut(&current.shard_id) {
                        entry.lease = stored;
                    }
                }
                _ => {
                    warn!(
                        "Lost ownership of shard {} during renewal",
                        current.shard_id
                    );
                    self.mark_lost(&current.shard_id).await;
                    lost.push(current.shard_id);
                }
            }
        }
        Ok(lost)
    }

    /// Persist a checkpoint for a held lease
    ///
    /// Rejects regressions; counter mismatch means the lease was stolen and
    /// the consumer must stop without committing further work.
    pub async fn commit_checkpoint(
        &self,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
    ) -> Result<CommitOutcome> {
        loop {
            let current = {
                let held = self.held.read().await;
                match held.get(shard_id) {
                    Some(entry) => entry.lease.clone(),
                    None => return Ok(CommitOutcome::OwnershipLost),
                }
            };

            if !current.checkpoint.can_advance_to(&checkpoint) {
                return Err(RiptideError::CheckpointRegression {
                    shard_id: shard_id.clone(),
                    current: current.checkpoint,
                    attempted: checkpoint,
                });
            }

            let mut updated = current.taken_by(&self.worker_id);
            updated.checkpoint = checkpoint.clone();

            if self.put_with_retry(current.counter, updated.clone()).await? {
                debug!("Committed checkpoint {} for shard {}", checkpoint, shard_id);
                standard::CHECKPOINTS_COMMITTED.inc();
                let mut held = self.held.write().await;
                if let Some(entry) = held.get_mut(shard_id) {
                    entry.lease = updated;
                }
                return Ok(CommitOutcome::Committed);
            }

            // A concurrent local renewal bumps the counter too; retry with
            // the stored counter in that case, declare loss otherwise.
            match self.get_with_retry(shard_id).await? {
                Some(stored) if stored.owner.as_deref() == Some(self.worker_id.as_str()) => {
                    let mut held = self.held.write().await;
                    if let Some(entry) = held.get_mut(shard_id) {
                        entry.lease = stored;
                    }
                    continue;
                }
                _ => {
                    warn!(
                        "Lost ownership of shard {} during checkpoint commit",
                        shard_id
                    );
                    self.mark_lost(shard_id).await;
                    return Ok(CommitOutcome::OwnershipLost);
                }
            }
        }
    }

    /// Release a held lease, clearing the owner field
    ///
    /// Used on graceful consumer stop. If the conditional write loses, the
    /// lease was already stolen and there is nothing to release.
    pub async fn release(&self, shard_id: &ShardId) -> Result<()> {
        let mut current = {
            let mut held = self.held.write().await;
            let entry = held.remove(shard_id);
            standard::LEASES_HELD.set(held.len() as i64);
            match entry {
                Some(entry) => entry.lease,
                None => return Ok(()),
            }
        };

        loop {
            let mut released = current.clone();
            released.owner = None;
            released.counter += 1;
            released.last_renewal_epoch_ms = chrono::Utc::now().timestamp_millis();

            if self.put_with_retry(current.counter, released).await? {
                info!("Released lease for shard {}", shard_id);
                return Ok(());
            }

            // Counter moved: a renewal of ours raced the release, or the
            // lease was stolen or retired. Only retry while we still own it.
            match self.get_with_retry(shard_id).await? {
                Some(stored) if stored.owner.as_deref() == Some(self.worker_id.as_str()) => {
                    current = stored;
                }
                _ => {
                    debug!(
                        "Release for shard {} found the lease already taken over",
                        shard_id
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Drop a lease from the held set without touching the store, and bar
    /// this worker from re-acquiring the shard
    ///
    /// Used when a consumer fails: renewal stops so the lease expires and a
    /// peer can steal it, but the owner field is left as-is because this
    /// worker's view of the shard is suspect, and the shard is quarantined
    /// locally so the failed consumer is not restarted here.
    pub async fn evict(&self, shard_id: &ShardId) {
        let mut held = self.held.write().await;
        if held.remove(shard_id).is_some() {
            info!("Evicted lease for shard {} from the held set", shard_id);
        }
        standard::LEASES_HELD.set(held.len() as i64);
        drop(held);
        self.quarantined.write().await.insert(shard_id.clone());
    }

    /// Watch that flips to false the moment ownership of the shard is lost
    pub async fn ownership_watch(&self, shard_id: &ShardId) -> Option<watch::Receiver<bool>> {
        let held = self.held.read().await;
        held.get(shard_id).map(|h| h.owned_tx.subscribe())
    }

    /// Copy of the held lease for a shard, if any
    pub async fn held_lease(&self, shard_id: &ShardId) -> Option<Lease> {
        let held = self.held.read().await;
        held.get(shard_id).map(|h| h.lease.clone())
    }

    /// Shards currently held by this worker
    pub async fn held_shards(&self) -> Vec<ShardId> {
        let held = self.held.read().await;
        let mut shards: Vec<ShardId> = held.keys().cloned().collect();
        shards.sort();
        shards
    }

    async fn mark_lost(&self, shard_id: &ShardId) {
        let mut held = self.held.write().await;
        if let Some(entry) = held.remove(shard_id) {
            entry.owned_tx.send_replace(false);
        }
        standard::LEASES_HELD.set(held.len() as i64);
        standard::LEASES_LOST.inc();
    }

    async fn get_with_retry(&self, shard_id: &ShardId) -> Result<Option<Lease>> {
        let mut attempt = 0;
        loop {
            match self.store.get(shard_id).await {
                Ok(lease) => return Ok(lease),
                Err(e) => self.backoff_or_bail("get", &e, &mut attempt).await?,
            }
        }
    }

    async fn put_with_retry(&self, expected_counter: u64, lease: Lease) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.store.put_conditional(expected_counter, lease.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(e) => self.backoff_or_bail("put", &e, &mut attempt).await?,
            }
        }
    }

    async fn backoff_or_bail(
        &self,
        op: &str,
        error: &StoreError,
        attempt: &mut u32,
    ) -> Result<()> {
        if !error.is_retryable() || *attempt + 1 >= self.store_retry.max_attempts {
            return Err(RiptideError::StoreExhausted {
                attempts: *attempt + 1,
                message: error.to_string(),
            });
        }
        warn!(
            "Lease store {} attempt {}/{} failed: {}",
            op,
            *attempt + 1,
            self.store_retry.max_attempts,
            error
        );
        tokio::time::sleep(self.store_retry.delay_for(*attempt)).await;
        *attempt += 1;
        Ok(())
    }
}
