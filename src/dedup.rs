//! Expiring key sets used for admission dedup and logical removal
//!
//! Two sets live next to every queue:
//!
//! - the dedup set holds the key of every admitted job until the job is
//!   released, removed, purged or its entry expires; a push for a live key is
//!   not admitted
//! - the tombstone set holds the correlation id of every removed job that may
//!   still sit in a host queue or be in flight; dispatch drops tombstoned
//!   entries instead of scanning the queue at removal time
//!
//! Entries carry an absolute expiry (or none). Reads evict lazily, and
//! [`ExpiringSet::cleanup`] evicts in bulk.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::QueueResult;

/// Handle on one named expiring set inside the coordinator
#[async_trait]
pub trait ExpiringSet: Send + Sync {
    /// Record `key` with expiry `now + ttl`, or never when `ttl` is `None`.
    /// Setting an existing key replaces its expiry.
    async fn set(&self, key: &str, ttl: Option<Duration>) -> QueueResult<()>;

    /// Whether `key` is present and unexpired; evicts it if it has expired
    async fn has(&self, key: &str) -> QueueResult<bool>;

    /// Remove `key`, returning the number of entries deleted
    async fn delete(&self, key: &str) -> QueueResult<u64>;

    /// Number of unexpired entries
    async fn size(&self) -> QueueResult<u64>;

    /// Evict every expired entry, returning how many were removed
    async fn cleanup(&self) -> QueueResult<u64>;
}

/// Whether an entry with this expiry is still live at `now_ms`
pub fn is_live(expires_at: Option<i64>, now_ms: i64) -> bool {
    expires_at.map_or(true, |at| at > now_ms)
}

/// Sorted-set score for an expiry (`+inf` for never)
pub fn score(expires_at: Option<i64>) -> String {
    match expires_at {
        Some(at) => at.to_string(),
        None => "+inf".to_string(),
    }
}
