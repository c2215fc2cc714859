//! Instance liveness and crash recovery
//!
//! Every instance renews a lease while it is open. Its in-flight records are
//! put back at the front of their host queues either by itself on the next
//! wake-up, or by any other instance once the lease has lapsed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{FairQueue, QueueInner};
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::metrics;
use crate::models::Payload;

/// Renew the instance lease until the queue shuts down
pub(super) fn spawn_heartbeat(inner: &Arc<QueueInner>) {
    let inner = Arc::clone(inner);
    let tasks = inner.tasks.clone();

    tasks.spawn(async move {
        let lease = inner.config.stale_interval();
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
        // First tick fires immediately; registration already covered it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = inner
                        .coordinator
                        .register_instance(&inner.instance_id, lease)
                        .await
                    {
                        warn!(instance = %inner.instance_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }

        debug!(instance = %inner.instance_id, "Heartbeat stopped");
    });
}

impl<P: Payload> FairQueue<P> {
    /// Recover jobs left in flight by this instance and by dead instances.
    ///
    /// Runs once per instance; a second call fails with
    /// [`QueueError::AlreadyAwake`]. Returns the number of jobs put back.
    pub async fn wake_up(&self) -> QueueResult<usize> {
        let inner = &self.inner;
        if inner.awake.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyAwake {
                instance: inner.instance_id.clone(),
            });
        }

        match self.recover_all().await {
            Ok(recovered) => {
                metrics::record_recovered(self.name(), recovered);
                inner.events.emit(QueueEvent::WokeUp { recovered });
                info!(
                    queue = %inner.config.name,
                    instance = %inner.instance_id,
                    recovered,
                    "Instance awake"
                );
                Ok(recovered)
            }
            Err(e) => {
                inner.awake.store(false, Ordering::SeqCst);
                warn!(instance = %inner.instance_id, error = %e, "Wake-up recovery failed");
                inner.events.error(e.to_string(), None);
                Err(e)
            }
        }
    }

    async fn recover_all(&self) -> QueueResult<usize> {
        let coordinator = &self.inner.coordinator;
        let own = &self.inner.instance_id;

        let mut recovered = coordinator.recover(own).await?.len();
        // Recovery forgets the instance; keep ours visible to orphan scans
        coordinator
            .register_instance(own, self.inner.config.stale_interval())
            .await?;

        for instance in coordinator.orphaned_instances(own).await? {
            let records = coordinator.recover(&instance).await?;
            if !records.is_empty() {
                info!(
                    dead_instance = %instance,
                    count = records.len(),
                    "Recovered jobs of a dead instance"
                );
            }
            recovered += records.len();
        }

        Ok(recovered)
    }
}
