//! Key layout of one named queue in the shared store

/// Expiring set holding admitted keys
pub const DEDUP_SET: &str = "dedup";

/// Expiring set holding correlation ids of removed jobs
pub const TOMBSTONE_SET: &str = "removed";

/// Every key of one queue, derived from `{prefix}:{name}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    base: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            base: namespace.into(),
        }
    }

    /// Main rotation: one occurrence per available slot
    pub fn main(&self) -> String {
        self.base.clone()
    }

    /// Pending rotation: one occurrence per slot in flight
    pub fn pending(&self) -> String {
        format!("{}:pending-hosts", self.base)
    }

    pub fn host_prefix(&self) -> String {
        format!("{}:host:", self.base)
    }

    pub fn host_queue(&self, destination: &str) -> String {
        format!("{}{}", self.host_prefix(), destination)
    }

    /// Destinations with a non-empty host queue
    pub fn hosts(&self) -> String {
        format!("{}:hosts", self.base)
    }

    pub fn concurrency(&self) -> String {
        format!("{}:concurrency", self.base)
    }

    /// Named expiring set (see [`DEDUP_SET`], [`TOMBSTONE_SET`])
    pub fn set(&self, name: &str) -> String {
        format!("{}:{}", self.base, name)
    }

    /// Key → correlation id of its live admission
    pub fn keys(&self) -> String {
        format!("{}:keys", self.base)
    }

    pub fn inflight(&self, instance: &str) -> String {
        format!("{}:inflight:{}", self.base, instance)
    }

    pub fn instances(&self) -> String {
        format!("{}:instances", self.base)
    }

    pub fn lease(&self, instance: &str) -> String {
        format!("{}:lease:{}", self.base, instance)
    }

    pub fn result(&self, correlation_id: &str) -> String {
        format!("{}:result:{}", self.base, correlation_id)
    }
}
