//! Worker identity
//!
//! A process-unique string used as the lease owner field: hostname plus a
//! random suffix so restarts and co-located workers never collide.

use std::fmt;
use uuid::Uuid;

/// Process-unique worker identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    /// Generate a fresh identity for this process
    pub fn generate() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", hostname, &suffix[..8]))
    }

    /// Use a caller-provided identity verbatim
    pub fn named(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
