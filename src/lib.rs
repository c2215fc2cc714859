//! fairq - Distributed fair-dispatch job scheduler
//!
//! Jobs are grouped by destination (for URLs, the host). Each destination has
//! its own FIFO queue and a concurrency limit, and dispatch round-robins over
//! destinations with a free slot, so a destination with a huge backlog cannot
//! starve the others. All coordination state lives in Redis, so any number of
//! processes can push and consume the same queue.
//!
//! # Architecture
//!
//! - [`config`] - Queue, Redis and logging configuration
//! - [`coordinator`] - Atomic state transactions (Redis and in-memory backends)
//! - [`queue`] - The [`FairQueue`] engine: admission, dispatch, release, recovery
//! - [`worker`] - Bounded worker loop with per-job failure isolation
//! - [`correlation`] - Publishing job outcomes and waiting for them
//! - [`dedup`] - Expiring key sets used for deduplication and removal
//! - [`events`] - Observer channel for errors, warnings and releases
//! - [`metrics`] - Prometheus counters
//! - [`models`] - Payloads, tokens, outcomes and statistics
//!
//! # Example
//!
//! ```no_run
//! use fairq::{FairQueue, QueueConfig, UrlPayload, WaitOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue: FairQueue<UrlPayload> = FairQueue::new(QueueConfig::from_env()?).await?;
//!
//!     let _worker = queue.process(4, |job: UrlPayload| async move {
//!         Ok::<_, std::io::Error>(job.url.len())
//!     })?;
//!
//!     let admission = queue.push(&UrlPayload::new("https://example.com/a"), 2).await?;
//!     if let Some(id) = admission.correlation_id() {
//!         let options = WaitOptions::new().with_timeout(Duration::from_secs(5));
//!         let outcome = queue.wait_for(id, options).await?;
//!         println!("{outcome:?}");
//!     }
//!
//!     queue.close(true).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod dedup;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::coordinator::{Coordinator, MemoryCoordinator, RedisCoordinator};
    pub use crate::correlation::WaitOptions;
    pub use crate::error::{ErrorCategory, QueueError, QueueResult};
    pub use crate::events::QueueEvent;
    pub use crate::models::{
        AckToken, Admission, CorrelationId, Dispatch, Outcome, Payload, QueueStats, UrlPayload,
    };
    pub use crate::queue::FairQueue;
    pub use crate::worker::WorkerHandle;
}

// Direct re-exports for convenience
pub use config::QueueConfig;
pub use correlation::WaitOptions;
pub use error::{QueueError, QueueResult};
pub use models::{Admission, CorrelationId, Outcome, Payload, UrlPayload};
pub use queue::FairQueue;
