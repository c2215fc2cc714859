//! Core data structures shared by the queue, the coordinator and the worker loop

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

use crate::error::{QueueError, QueueResult};

/// Lowest accepted per-destination concurrency
pub const MIN_CONCURRENCY: u32 = 1;

/// Highest accepted per-destination concurrency
pub const MAX_CONCURRENCY: u32 = 20;

/// Validate a per-destination concurrency limit
pub fn validate_concurrency(concurrency: u32) -> QueueResult<u32> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
        Ok(concurrency)
    } else {
        Err(QueueError::invalid_concurrency(concurrency))
    }
}

/// Extract the host part of a URL key
pub fn host_of(key: &str) -> QueueResult<String> {
    let parsed =
        Url::parse(key).map_err(|e| QueueError::InvalidPayload(format!("'{key}': {e}")))?;

    parsed
        .host_str()
        .map(|s| s.to_string())
        .ok_or_else(|| QueueError::InvalidPayload(format!("'{key}' has no host")))
}

// ============================================================================
// Payload
// ============================================================================

/// A job body the queue can route.
///
/// The key identifies the job for deduplication and removal. The destination
/// groups jobs under one concurrency budget and defaults to the host of the key
/// parsed as a URL; override [`Payload::destination`] to route differently.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Dedup/removal key of this job
    fn key(&self) -> &str;

    /// Destination this job is charged against
    fn destination(&self) -> QueueResult<String> {
        host_of(self.key())
    }
}

/// Stock payload: a URL plus arbitrary extra fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlPayload {
    /// Target URL, also the dedup key
    pub url: String,

    /// Any additional job fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UrlPayload {
    /// Create a payload with no extra fields
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Attach an extra field
    pub fn with_field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }
}

impl Payload for UrlPayload {
    fn key(&self) -> &str {
        &self.url
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier binding an admitted job to its eventual outcome
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh correlation id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Handle returned by `next()` and consumed by `release()`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckToken {
    /// Unique per dispatch
    pub id: String,

    /// Destination whose slot is held
    pub destination: String,

    /// Admission the dispatched job belongs to
    pub correlation_id: CorrelationId,
}

impl AckToken {
    /// Fresh id for the in-flight record of one dispatch
    pub(crate) fn mint_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Result of `push` / `unshift`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Job queued under this correlation id
    Admitted(CorrelationId),

    /// Key already present in the dedup cache, nothing changed
    NotAdmitted,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// Correlation id of an admitted job
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Admitted(id) => Some(id),
            Self::NotAdmitted => None,
        }
    }
}

/// Where an admitted entry lands in its host queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Append (push)
    Back,
    /// Prepend (unshift)
    Front,
}

/// Envelope stored in host queues and in-flight records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub correlation_id: String,
    pub key: String,
    pub destination: String,
    pub concurrency: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl QueueEntry {
    pub fn decode(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| QueueError::sanity(format!("undecodable queue entry: {e}")))
    }

    pub fn encode(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A job handed out by `next()`
#[derive(Debug, Clone)]
pub struct Dispatch<P> {
    pub destination: String,
    pub payload: P,
    pub ack: AckToken,
    pub correlation_id: CorrelationId,
    pub concurrency: u32,
}

// ============================================================================
// Stats
// ============================================================================

/// Best-effort snapshot of queue occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Occurrences in the pending rotation (slots in flight)
    pub pending: u64,

    /// Occurrences in main + pending rotation
    pub total: u64,

    /// Jobs waiting in host queues
    pub backlog: u64,
}

/// Destination → occurrence count
pub type HostCounts = HashMap<String, u64>;

/// Count occurrences of each destination in a rotation list
pub fn count_hosts(hosts: &[String]) -> HostCounts {
    let mut counts = HostCounts::new();
    for host in hosts {
        *counts.entry(host.clone()).or_insert(0) += 1;
    }
    counts
}

// ============================================================================
// Outcomes
// ============================================================================

/// Kind of published outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Success,
    Error,
}

/// Error as seen by a remote waiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
}

/// Result of processing one job, delivered to `wait_for`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub correlation_id: CorrelationId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl Outcome {
    pub fn success(
        correlation_id: CorrelationId,
        payload: serde_json::Value,
        result: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id,
            event_type: EventType::Success,
            payload,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(
        correlation_id: CorrelationId,
        payload: serde_json::Value,
        error: SerializedError,
    ) -> Self {
        Self {
            correlation_id,
            event_type: EventType::Error,
            payload,
            result: None,
            error: Some(error),
        }
    }

    /// Decode the job payload
    pub fn payload_as<P: DeserializeOwned>(&self) -> QueueResult<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_success(&self) -> bool {
        self.event_type == EventType::Success
    }
}
