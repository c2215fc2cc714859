//! Error handling for the fairq crate
//!
//! Every fallible queue operation returns [`QueueResult`]. The variants map
//! one-to-one onto the failure classes a caller has to tell apart:
//!
//! - admission-time rejections ([`QueueError::InvalidConcurrency`],
//!   [`QueueError::QueueFull`], [`QueueError::InvalidPayload`]) are synchronous
//!   and leave no state behind
//! - coordinator failures ([`QueueError::Transport`], [`QueueError::Pool`]) are
//!   retried once where the operation allows it, then propagated
//! - [`QueueError::SanityCheck`] signals a broken accounting invariant and is
//!   never corrected silently
//!
//! A deduplicated push is not an error; see [`crate::models::Admission`].

use thiserror::Error;

/// Result type alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Caller supplied something the queue refuses to admit
    Admission,
    /// Coordinator connectivity or pooling
    Transport,
    /// User processing code failed
    Callback,
    /// Lifecycle misuse (closed queue, double wake-up)
    Lifecycle,
    /// Synchronous waiter gave up
    Wait,
    /// Internal invariant violation
    Internal,
    /// Configuration errors
    Config,
}

/// Errors produced by the fair queue
#[derive(Error, Debug)]
pub enum QueueError {
    /// Per-destination concurrency outside the accepted range
    #[error("Invalid concurrency {value}: must be between {min} and {max}")]
    InvalidConcurrency { value: u32, min: u32, max: u32 },

    /// Host queue reached its configured maximum length
    #[error("Queue is full for destination '{destination}' (max {max_length}), message dropped")]
    QueueFull {
        destination: String,
        max_length: usize,
    },

    /// Payload does not expose a usable key or destination
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Coordinator command failed
    #[error("Coordinator transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Connection pool could not hand out a connection
    #[error("Coordinator pool error: {0}")]
    Pool(String),

    /// Entry or outcome (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// User callback failed while processing a job
    #[error("Callback failed for {correlation_id}: {message}")]
    Callback {
        correlation_id: String,
        message: String,
    },

    /// `wake_up` called twice on the same instance
    #[error("Instance {instance} is already awake")]
    AlreadyAwake { instance: String },

    /// Accounting inconsistency detected in the coordinator state
    #[error("Sanity check failed: {0}")]
    SanityCheck(String),

    /// Operation attempted on a closed queue
    #[error("Queue is not active")]
    NotActive,

    /// `wait_for` deadline elapsed
    #[error("Timeout waiting for outcome of {correlation_id}")]
    Timeout { correlation_id: String },

    /// `wait_for` cancelled by the caller
    #[error("Aborted waiting for outcome of {correlation_id}")]
    Aborted { correlation_id: String },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),
}

impl QueueError {
    /// Create an invalid concurrency error for the given value
    pub fn invalid_concurrency(value: u32) -> Self {
        Self::InvalidConcurrency {
            value,
            min: crate::models::MIN_CONCURRENCY,
            max: crate::models::MAX_CONCURRENCY,
        }
    }

    /// Create a sanity check error
    pub fn sanity(reason: impl Into<String>) -> Self {
        Self::SanityCheck(reason.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if the error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            Self::Pool(_) | Self::QueueFull { .. } => true,
            _ => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConcurrency { .. } | Self::QueueFull { .. } | Self::InvalidPayload(_) => {
                ErrorCategory::Admission
            }
            Self::Transport(_) | Self::Pool(_) => ErrorCategory::Transport,
            Self::Callback { .. } => ErrorCategory::Callback,
            Self::AlreadyAwake { .. } | Self::NotActive => ErrorCategory::Lifecycle,
            Self::Timeout { .. } | Self::Aborted { .. } => ErrorCategory::Wait,
            Self::SanityCheck(_) | Self::Serialization(_) => ErrorCategory::Internal,
            Self::Config(_) => ErrorCategory::Config,
        }
    }
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}
