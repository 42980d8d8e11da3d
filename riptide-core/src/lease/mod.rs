//! Lease tracking and coordination
//!
//! A lease is the durable ownership + progress record for one shard. The
//! store holds one lease per shard; the coordinator mutates them with
//! conditional writes so that at most one worker owns a shard at a time.

pub mod coordinator;
pub mod store;
mod types;

pub use coordinator::{AcquireOutcome, CommitOutcome, LeaseCoordinator};
pub use store::{InMemoryLeaseStore, LeaseStore, StoreError};
pub use types::{Checkpoint, Lease};
