//! Shared coordination store for fair queues
//!
//! Every instance of a queue talks to one coordinator. Each multi-step
//! mutation is a single atomic transaction; callers never see a rotation move
//! without its queue pop, or an admission without its rotation update.
//!
//! # Architecture
//!
//! ```text
//!  push/unshift ──admit──▶ ┌──────────────────────────────┐
//!                          │ host:{d}   per-destination   │
//!                          │            FIFO of entries   │
//!  next ──acquire_slot───▶ │ main       available slots   │
//!       ──checkout──────▶  │ pending    slots in flight   │
//!                          │ inflight   per-instance jobs │
//!  release ──release────▶  │ dedup / removed / keys       │
//!                          └──────────────────────────────┘
//! ```
//!
//! Two backends implement [`Coordinator`]:
//!
//! - [`RedisCoordinator`]: many processes share one Redis; transactions are
//!   Lua scripts and the slot wait is a `BLMOVE` on a dedicated connection.
//! - [`MemoryCoordinator`]: a single process; one mutex guards the whole
//!   state and waits park on a `Notify`.

pub mod keys;
pub mod memory;
pub mod redis;
pub mod scripts;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::dedup::ExpiringSet;
use crate::error::QueueResult;
use crate::models::Placement;

pub use self::keys::{KeySpace, DEDUP_SET, TOMBSTONE_SET};
pub use self::memory::MemoryCoordinator;
pub use self::redis::RedisCoordinator;

// ============================================================================
// Transaction Inputs and Outputs
// ============================================================================

/// Everything the admission transaction needs
#[derive(Debug, Clone)]
pub struct AdmitRequest<'a> {
    pub destination: &'a str,
    pub key: &'a str,
    pub correlation_id: &'a str,
    /// Encoded [`crate::models::QueueEntry`]
    pub entry: &'a str,
    pub concurrency: u32,
    pub placement: Placement,
    /// Absolute dedup expiry in ms, `None` for never
    pub dedup_expires_at: Option<i64>,
    pub max_queue_length: Option<usize>,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    /// Key has a live dedup entry
    Duplicate,
    /// Host queue already holds `length` entries
    QueueFull { length: u64 },
}

/// Result of popping the head of a host queue after a slot was acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkout {
    /// Entry recorded in flight for the calling instance
    Dispatched(String),
    /// Entry was tombstoned; its slot has already been settled
    Discarded(String),
    /// Host queue was empty; the destination left both rotations
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released {
        requeued: bool,
        /// No Pending occurrence was left for the job and no concurrency
        /// change since its admission accounts for that
        slot_missing: bool,
    },
    /// No in-flight record for the token
    Unknown,
}

/// Raw contents of both rotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationSnapshot {
    pub main: Vec<String>,
    pub pending: Vec<String>,
}

// ============================================================================
// Coordinator Trait
// ============================================================================

/// Atomic operations over the shared queue state
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Dedup check, capacity check, enqueue and rotation reconciliation
    async fn admit(&self, request: &AdmitRequest<'_>) -> QueueResult<AdmitOutcome>;

    /// Move the oldest Main occurrence to Pending, waiting up to `timeout`.
    ///
    /// Returns `None` when no slot became available in time or
    /// [`Coordinator::wake_waiters`] interrupted the wait. Dropping the
    /// returned future never loses a slot.
    async fn acquire_slot(&self, timeout: Duration) -> QueueResult<Option<String>>;

    /// Pop the head of `destination`'s host queue for a slot just acquired
    async fn checkout(
        &self,
        destination: &str,
        instance: &str,
        token: &str,
        now_ms: i64,
    ) -> QueueResult<Checkout>;

    /// Undo an [`Coordinator::acquire_slot`] whose slot will not be used
    async fn return_slot(&self, destination: &str) -> QueueResult<()>;

    /// Put an in-flight record back at the head of its host queue and give
    /// its Pending occurrence back; false if the record is gone
    async fn requeue(&self, instance: &str, token: &str, destination: &str) -> QueueResult<bool>;

    /// Drop the in-flight record and settle the slot
    async fn release(
        &self,
        instance: &str,
        token: &str,
        destination: &str,
    ) -> QueueResult<ReleaseOutcome>;

    /// Tombstone the live admission of `key`; false if there is none
    async fn remove(&self, key: &str, tombstone_expires_at: i64) -> QueueResult<bool>;

    /// Delete a destination's host queue and its Main occurrences
    async fn purge(&self, destination: &str) -> QueueResult<u64>;

    /// Register `instance` and refresh its liveness lease
    async fn register_instance(&self, instance: &str, lease: Duration) -> QueueResult<()>;

    /// Drop the lease of `instance`; its in-flight records stay recoverable
    async fn retire_instance(&self, instance: &str) -> QueueResult<()>;

    /// Registered instances other than `own` whose lease has expired
    async fn orphaned_instances(&self, own: &str) -> QueueResult<Vec<String>>;

    /// Return every in-flight record of `instance` to the head of its host
    /// queue, restore rotation state and deregister the instance
    async fn recover(&self, instance: &str) -> QueueResult<Vec<String>>;

    async fn snapshot(&self) -> QueueResult<RotationSnapshot>;

    /// Entries of one host queue, head first
    async fn host_queue(&self, destination: &str) -> QueueResult<Vec<String>>;

    async fn host_queue_len(&self, destination: &str) -> QueueResult<u64>;

    /// Destinations with a non-empty host queue
    async fn destinations(&self) -> QueueResult<Vec<String>>;

    /// Store an outcome for `correlation_id`, retained for `ttl`
    async fn publish(&self, correlation_id: &str, outcome: &str, ttl: Duration)
        -> QueueResult<()>;

    /// Wait for and consume one outcome for `correlation_id`.
    ///
    /// The subscription lives exactly as long as the returned future.
    async fn wait_outcome(&self, correlation_id: &str) -> QueueResult<String>;

    /// Interrupt local [`Coordinator::acquire_slot`] waits
    fn wake_waiters(&self);

    /// Handle on a named expiring set of this queue
    fn expiring_set(&self, name: &str) -> Arc<dyn ExpiringSet>;
}
