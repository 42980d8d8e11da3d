//! Consumer configuration
//!
//! An explicit, statically validated configuration struct. Unknown knobs
//! cannot exist by construction; inconsistent values are rejected by
//! `validate()` before a worker starts.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::RiptideError;
use crate::retry::RetryPolicy;

/// Where a shard's consumption starts when its lease has no checkpoint yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialPosition {
    /// Start at the stream tip
    Latest,
    /// Start at the oldest retained record
    TrimHorizon,
    /// Start at the first record at or after the timestamp
    AtTimestamp(DateTime<Utc>),
}

/// Configuration for a stream consumption worker
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream to consume
    pub stream_name: String,
    /// Application / consumer-group identifier; scopes the lease table
    pub application_name: String,
    /// Worker identity override; generated from hostname + suffix when None
    pub worker_id: Option<String>,
    /// Position policy for shards with no checkpoint yet
    pub initial_position: InitialPosition,
    /// How long a lease may go unrenewed before peers may steal it
    pub lease_duration: Duration,
    /// How often held leases are renewed; must be well under
    /// `lease_duration`
    pub renewal_interval: Duration,
    /// How often discovery + lease acquisition runs
    pub coordination_interval: Duration,
    /// Commit a checkpoint at least this often while records flow
    pub checkpoint_interval: Duration,
    /// Commit a checkpoint after this many records regardless of time
    pub checkpoint_records: u64,
    /// Upper bound on leases acquired in one coordination cycle
    pub max_acquires_per_cycle: usize,
    /// Maximum records per poll
    pub poll_batch_limit: usize,
    /// Sleep between polls that returned no records
    pub idle_poll_delay: Duration,
    /// Retry policy for the downstream pipeline
    pub dispatch_retry: RetryPolicy,
    /// Retry policy for lease store and stream source calls
    pub store_retry: RetryPolicy,
    /// How long graceful shutdown waits for consumer tasks to drain
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            application_name: String::new(),
            worker_id: None,
            initial_position: InitialPosition::Latest,
            lease_duration: Duration::from_secs(crate::DEFAULT_LEASE_DURATION_SECS),
            renewal_interval: Duration::from_secs(crate::DEFAULT_RENEWAL_INTERVAL_SECS),
            coordination_interval: Duration::from_secs(20),
            checkpoint_interval: Duration::from_secs(crate::DEFAULT_CHECKPOINT_INTERVAL_SECS),
            checkpoint_records: 1000,
            max_acquires_per_cycle: 3,
            poll_batch_limit: 500,
            idle_poll_delay: Duration::from_millis(250),
            dispatch_retry: RetryPolicy::new(3, Duration::from_millis(200)),
            store_retry: RetryPolicy::new(5, Duration::from_millis(100)),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ConsumerConfig {
    /// Create a config for the given stream and application
    pub fn new(stream_name: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            application_name: application_name.into(),
            ..Default::default()
        }
    }

    /// Reject inconsistent values before any worker is built from this
    /// config
    pub fn validate(&self) -> Result<(), RiptideError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> RiptideError {
            RiptideError::InvalidConfig {
                field,
                reason: reason.into(),
            }
        }

        if self.stream_name.is_empty() {
            return Err(invalid("stream_name", "must not be empty"));
        }
        if self.application_name.is_empty() {
            return Err(invalid("application_name", "must not be empty"));
        }
        if self.lease_duration.is_zero() {
            return Err(invalid("lease_duration", "must be positive"));
        }
        if self.renewal_interval >= self.lease_duration {
            return Err(invalid(
                "renewal_interval",
                format!(
                    "{:?} must be shorter than lease_duration {:?}",
                    self.renewal_interval, self.lease_duration
                ),
            ));
        }
        if self.coordination_interval.is_zero() {
            return Err(invalid("coordination_interval", "must be positive"));
        }
        if self.checkpoint_records == 0 {
            return Err(invalid("checkpoint_records", "must be at least 1"));
        }
        if self.max_acquires_per_cycle == 0 {
            return Err(invalid("max_acquires_per_cycle", "must be at least 1"));
        }
        if self.poll_batch_limit == 0 {
            return Err(invalid("poll_batch_limit", "must be at least 1"));
        }
        if self.dispatch_retry.max_attempts == 0 {
            return Err(invalid("dispatch_retry", "max_attempts must be at least 1"));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(invalid("store_retry", "max_attempts must be at least 1"));
        }
        Ok(())
    }
}
