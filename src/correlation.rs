//! Result correlation channel
//!
//! A worker publishes the [`Outcome`] of each job under its correlation id; a
//! producer anywhere in the cluster can block on that id with
//! [`FairQueue::wait_for`]. Outcomes are kept for `result_ttl`, so a waiter
//! that arrives after the job finished still sees it.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::models::{CorrelationId, Outcome, Payload};
use crate::queue::FairQueue;

/// How long and how interruptibly to wait for an outcome
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Give up with [`QueueError::Timeout`] after this long; `None` waits forever
    pub timeout: Option<Duration>,

    /// Give up with [`QueueError::Aborted`] once this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl<P: Payload> FairQueue<P> {
    /// Deliver an outcome to whoever waits (or will wait) on its correlation id
    pub async fn publish(&self, outcome: &Outcome) -> QueueResult<()> {
        let encoded = serde_json::to_string(outcome)?;
        self.inner
            .coordinator
            .publish(
                outcome.correlation_id.as_str(),
                &encoded,
                self.inner.config.result_ttl(),
            )
            .await?;
        debug!(correlation_id = %outcome.correlation_id, "Outcome published");
        Ok(())
    }

    /// Wait for the outcome of the job admitted under `correlation_id`.
    ///
    /// Nothing is left registered once this returns, whichever way it ends.
    pub async fn wait_for(
        &self,
        correlation_id: &CorrelationId,
        options: WaitOptions,
    ) -> QueueResult<Outcome> {
        let cancel = options.cancel.unwrap_or_default();
        let deadline = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(QueueError::Aborted {
                    correlation_id: correlation_id.to_string(),
                });
            }
            raw = self.inner.coordinator.wait_outcome(correlation_id.as_str()) => raw?,
            _ = deadline => {
                return Err(QueueError::Timeout {
                    correlation_id: correlation_id.to_string(),
                });
            }
        };

        Ok(serde_json::from_str(&raw)?)
    }
}
