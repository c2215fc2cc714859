//! Bounded worker loop
//!
//! [`FairQueue::process`] keeps up to `concurrency` callbacks running, feeding
//! each one job from [`FairQueue::next`]. A job is released (and its outcome
//! published) when its callback finishes, whether it succeeded, failed or
//! panicked. Jobs still running when the queue closes are left in flight for
//! a later wake-up to recover.

use futures::FutureExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::models::{Dispatch, Outcome, Payload, SerializedError};
use crate::queue::FairQueue;
use crate::utils::short_type_name;

/// Handle on a running worker loop
pub type WorkerHandle = JoinHandle<QueueResult<()>>;

/// Pause after a failed `next()` before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

impl<P: Payload> FairQueue<P> {
    /// Start a worker loop running up to `concurrency` callbacks at once.
    ///
    /// The loop first runs [`FairQueue::wake_up`] and stops when the queue
    /// closes.
    pub fn process<F, Fut, R, E>(&self, concurrency: usize, callback: F) -> QueueResult<WorkerHandle>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        if concurrency == 0 {
            return Err(QueueError::config("worker concurrency must be at least 1"));
        }
        if !self.is_active() {
            return Err(QueueError::NotActive);
        }

        let queue = self.clone();
        let callback = Arc::new(callback);
        Ok(self
            .inner
            .tasks
            .spawn(run_loop(queue, concurrency, callback)))
    }
}

async fn run_loop<P, F, Fut, R, E>(
    queue: FairQueue<P>,
    concurrency: usize,
    callback: Arc<F>,
) -> QueueResult<()>
where
    P: Payload,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    match queue.wake_up().await {
        Ok(_) => {}
        Err(QueueError::AlreadyAwake { instance }) => {
            debug!(instance = %instance, "Already awake, worker skips recovery");
        }
        Err(e) => return Err(e),
    }

    info!(queue = %queue.name(), concurrency, "Worker started");

    let shutdown = queue.inner.shutdown.clone();
    let mut jobs: JoinSet<()> = JoinSet::new();

    loop {
        while jobs.try_join_next().is_some() {}
        metrics::set_in_flight(queue.name(), jobs.len());

        if !queue.is_active() {
            break;
        }

        if jobs.len() >= concurrency {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = jobs.join_next() => continue,
            }
        }

        let dispatch = match queue.next().await {
            Ok(dispatch) => dispatch,
            Err(QueueError::NotActive) => break,
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "Failed to fetch next job");
                queue.inner.events.error(e.to_string(), None);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                }
            }
        };

        jobs.spawn(run_job(queue.clone(), Arc::clone(&callback), dispatch));
    }

    if queue.inner.wait_for_jobs.load(Ordering::SeqCst) {
        debug!(running = jobs.len(), "Waiting for running jobs");
        while jobs.join_next().await.is_some() {}
    } else {
        jobs.detach_all();
    }
    metrics::set_in_flight(queue.name(), 0);

    info!(queue = %queue.name(), "Worker stopped");
    Ok(())
}

async fn run_job<P, F, Fut, R, E>(queue: FairQueue<P>, callback: Arc<F>, dispatch: Dispatch<P>)
where
    P: Payload,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    let Dispatch {
        payload,
        ack,
        correlation_id,
        destination,
        ..
    } = dispatch;

    let payload_json = match serde_json::to_value(&payload) {
        Ok(json) => json,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "Payload does not serialize");
            serde_json::Value::Null
        }
    };

    let outcome = {
        let _timer = metrics::start_job_timer(queue.name());
        let result = AssertUnwindSafe(async { callback(payload).await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(value)) => match serde_json::to_value(&value) {
                Ok(value) => Outcome::success(correlation_id.clone(), payload_json, value),
                Err(e) => Outcome::failure(
                    correlation_id.clone(),
                    payload_json,
                    SerializedError {
                        name: short_type_name::<serde_json::Error>(),
                        message: e.to_string(),
                    },
                ),
            },
            Ok(Err(e)) => Outcome::failure(
                correlation_id.clone(),
                payload_json,
                SerializedError {
                    name: short_type_name::<E>(),
                    message: e.to_string(),
                },
            ),
            Err(panic) => Outcome::failure(
                correlation_id.clone(),
                payload_json,
                SerializedError {
                    name: "Panic".to_string(),
                    message: panic_message(panic.as_ref()),
                },
            ),
        }
    };

    if let Some(err) = &outcome.error {
        let failure = QueueError::Callback {
            correlation_id: correlation_id.to_string(),
            message: format!("{}: {}", err.name, err.message),
        };
        warn!(destination = %destination, error = %failure, "Job failed");
        metrics::record_callback_failure(queue.name());
        queue
            .inner
            .events
            .error(failure.to_string(), Some(correlation_id.to_string()));
    }

    if !queue.is_active() {
        debug!(
            correlation_id = %correlation_id,
            "Job finished after shutdown, left for recovery"
        );
        return;
    }

    if queue.config().publish_results {
        if let Err(e) = queue.publish(&outcome).await {
            error!(correlation_id = %correlation_id, error = %e, "Failed to publish outcome");
            queue
                .inner
                .events
                .error(e.to_string(), Some(correlation_id.to_string()));
        }
    }

    // release() already logs and reports its own failures
    let _ = queue.release(&ack).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
