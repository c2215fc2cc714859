//! Fair queue engine
//!
//! [`FairQueue`] is the public face of one named queue. Producers call
//! [`FairQueue::push`] / [`FairQueue::unshift`]; consumers call
//! [`FairQueue::next`] and [`FairQueue::release`] directly or let
//! [`FairQueue::process`] drive them.
//!
//! # Example
//!
//! ```rust,ignore
//! use fairq::{FairQueue, QueueConfig, UrlPayload};
//!
//! let queue: FairQueue<UrlPayload> = FairQueue::new(QueueConfig::from_env()?).await?;
//! queue.push(&UrlPayload::new("https://example.com/a"), 2).await?;
//!
//! let job = queue.next().await?;
//! // ... work ...
//! queue.release(&job.ack).await?;
//! ```

mod claim;
pub mod position;
mod recovery;

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::coordinator::{
    AdmitOutcome, AdmitRequest, Checkout, Coordinator, RedisCoordinator, ReleaseOutcome,
    DEDUP_SET, TOMBSTONE_SET,
};
use crate::dedup::ExpiringSet;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent};
use crate::metrics;
use crate::models::{
    count_hosts, validate_concurrency, AckToken, Admission, CorrelationId, Dispatch, HostCounts,
    Payload, Placement, QueueEntry, QueueStats,
};
use crate::utils::{expiry_ms, now_ms};

use self::claim::Claim;

/// State shared by every clone of a queue handle and its background tasks
pub(crate) struct QueueInner {
    pub(crate) config: QueueConfig,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) instance_id: String,
    pub(crate) events: EventBus,
    pub(crate) active: AtomicBool,
    pub(crate) awake: AtomicBool,
    pub(crate) wait_for_jobs: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    /// Heartbeat and worker loops
    pub(crate) tasks: TaskTracker,
}

/// Handle on one named fair queue
pub struct FairQueue<P: Payload> {
    pub(crate) inner: Arc<QueueInner>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> Clone for FairQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _payload: PhantomData,
        }
    }
}

impl<P: Payload> std::fmt::Debug for FairQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairQueue")
            .field("name", &self.inner.config.name)
            .field("instance_id", &self.inner.instance_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<P: Payload> FairQueue<P> {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Connect to Redis and start the instance heartbeat
    pub async fn new(config: QueueConfig) -> QueueResult<Self> {
        config
            .validate()
            .map_err(|e| QueueError::config(e.to_string()))?;
        let coordinator = RedisCoordinator::connect(&config.redis, &config.namespace()).await?;
        Self::with_coordinator(config, Arc::new(coordinator)).await
    }

    /// Build a queue on an existing coordinator (e.g. a shared
    /// [`crate::coordinator::MemoryCoordinator`])
    pub async fn with_coordinator(
        config: QueueConfig,
        coordinator: Arc<dyn Coordinator>,
    ) -> QueueResult<Self> {
        config
            .validate()
            .map_err(|e| QueueError::config(e.to_string()))?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        coordinator
            .register_instance(&instance_id, config.stale_interval())
            .await?;

        let inner = Arc::new(QueueInner {
            events: EventBus::new(config.event_channel_capacity),
            coordinator,
            instance_id,
            active: AtomicBool::new(true),
            awake: AtomicBool::new(false),
            wait_for_jobs: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        });

        recovery::spawn_heartbeat(&inner);

        info!(
            queue = %inner.config.name,
            instance = %inner.instance_id,
            "Fair queue started"
        );

        Ok(Self {
            inner,
            _payload: PhantomData,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Identity under which this instance records in-flight jobs
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Observe errors, warnings, releases and wake-ups
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Keys currently blocking re-admission
    pub fn dedup_cache(&self) -> Arc<dyn ExpiringSet> {
        self.inner.coordinator.expiring_set(DEDUP_SET)
    }

    /// Correlation ids of removed jobs not yet skipped or released
    pub fn tombstones(&self) -> Arc<dyn ExpiringSet> {
        self.inner.coordinator.expiring_set(TOMBSTONE_SET)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Append a job to its destination's queue
    pub async fn push(&self, payload: &P, concurrency: u32) -> QueueResult<Admission> {
        self.admit(payload, concurrency, Placement::Back).await
    }

    /// Prepend a job so it is the next one dispatched for its destination
    pub async fn unshift(&self, payload: &P, concurrency: u32) -> QueueResult<Admission> {
        self.admit(payload, concurrency, Placement::Front).await
    }

    async fn admit(
        &self,
        payload: &P,
        concurrency: u32,
        placement: Placement,
    ) -> QueueResult<Admission> {
        let result = self.try_admit(payload, concurrency, placement).await;

        match &result {
            Ok(Admission::Admitted(_)) => metrics::record_admission(self.name()),
            Ok(Admission::NotAdmitted) => metrics::record_duplicate(self.name()),
            Err(e) => {
                let reason = format!("{:?}", e.category()).to_lowercase();
                metrics::record_rejection(self.name(), &reason);
            }
        }

        result
    }

    async fn try_admit(
        &self,
        payload: &P,
        concurrency: u32,
        placement: Placement,
    ) -> QueueResult<Admission> {
        let concurrency = validate_concurrency(concurrency)?;
        let destination = payload.destination()?;
        let key = payload.key().to_string();
        let correlation_id = CorrelationId::generate();

        let entry = QueueEntry {
            correlation_id: correlation_id.to_string(),
            key: key.clone(),
            destination: destination.clone(),
            concurrency,
            enqueued_at: chrono::Utc::now(),
            payload: serde_json::to_value(payload)?,
        }
        .encode()?;

        let now = now_ms();
        let request = AdmitRequest {
            destination: &destination,
            key: &key,
            correlation_id: correlation_id.as_str(),
            entry: &entry,
            concurrency,
            placement,
            dedup_expires_at: expiry_ms(now, self.inner.config.dedup_ttl()),
            max_queue_length: self.inner.config.max_queue_length,
            now_ms: now,
        };

        match self.inner.coordinator.admit(&request).await? {
            AdmitOutcome::Admitted => {
                debug!(
                    key = %key,
                    destination = %destination,
                    correlation_id = %correlation_id,
                    concurrency,
                    ?placement,
                    "Job admitted"
                );
                Ok(Admission::Admitted(correlation_id))
            }
            AdmitOutcome::Duplicate => {
                debug!(key = %key, "Duplicate key, not admitted");
                Ok(Admission::NotAdmitted)
            }
            AdmitOutcome::QueueFull { length } => {
                let max_length = self.inner.config.max_queue_length.unwrap_or(0);
                warn!(
                    destination = %destination,
                    length,
                    max_length,
                    "Host queue is full, message dropped"
                );
                Err(QueueError::QueueFull {
                    destination,
                    max_length,
                })
            }
        }
    }

    /// Logically delete the queued or in-flight job with this key.
    ///
    /// The job is dropped when it reaches the head of its queue, and the key
    /// may be pushed again immediately. Returns false if nothing was admitted
    /// under the key.
    pub async fn remove(&self, key: &str) -> QueueResult<bool> {
        let now = now_ms();
        let tombstone_expires_at =
            expiry_ms(now, Some(self.inner.config.tombstone_ttl())).unwrap_or(now);

        let removed = self
            .inner
            .coordinator
            .remove(key, tombstone_expires_at)
            .await?;
        debug!(key = %key, removed, "Remove requested");
        Ok(removed)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Wait for the next job from any destination with a free slot.
    ///
    /// Fails with [`QueueError::NotActive`] once the queue is closed, including
    /// while a call is waiting.
    pub async fn next(&self) -> QueueResult<Dispatch<P>> {
        loop {
            if !self.is_active() {
                return Err(QueueError::NotActive);
            }

            let Some(Claim {
                destination,
                token,
                checkout,
            }) = claim::claim_next(&self.inner).await?
            else {
                continue;
            };

            match checkout {
                Checkout::Dispatched(raw) => return self.dispatch(destination, token, &raw).await,
                Checkout::Discarded(raw) => {
                    let correlation_id = QueueEntry::decode(&raw)
                        .map(|e| e.correlation_id)
                        .unwrap_or_default();
                    debug!(
                        destination = %destination,
                        correlation_id = %correlation_id,
                        "Removed job discarded at dispatch"
                    );
                    metrics::record_discarded(self.name());
                    self.inner.events.emit(QueueEvent::Discarded {
                        destination,
                        correlation_id,
                    });
                }
                Checkout::Drained => {
                    debug!(destination = %destination, "Host queue drained, slot dropped");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        destination: String,
        token: String,
        raw: &str,
    ) -> QueueResult<Dispatch<P>> {
        let entry = QueueEntry::decode(raw)?;
        let correlation_id = CorrelationId::from(entry.correlation_id);
        let ack = AckToken {
            id: token,
            destination: destination.clone(),
            correlation_id: correlation_id.clone(),
        };

        let payload: P = match serde_json::from_value(entry.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    destination = %destination,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Queued payload does not decode, releasing its slot"
                );
                self.inner
                    .events
                    .error(format!("undecodable payload: {e}"), Some(correlation_id.to_string()));
                self.release(&ack).await?;
                return Err(e.into());
            }
        };

        metrics::record_dispatch(self.name());
        debug!(
            destination = %destination,
            correlation_id = %correlation_id,
            "Job dispatched"
        );

        Ok(Dispatch {
            destination,
            payload,
            ack,
            correlation_id,
            concurrency: entry.concurrency,
        })
    }

    /// Give back the slot held by a dispatched job.
    ///
    /// Returns false (and emits a warning event) for a token this instance
    /// does not hold.
    pub async fn release(&self, ack: &AckToken) -> QueueResult<bool> {
        let outcome = self
            .inner
            .coordinator
            .release(&self.inner.instance_id, &ack.id, &ack.destination)
            .await;

        match outcome {
            Ok(ReleaseOutcome::Released {
                requeued,
                slot_missing,
            }) => {
                if slot_missing {
                    warn!(
                        destination = %ack.destination,
                        correlation_id = %ack.correlation_id,
                        "Released job had no pending slot"
                    );
                    self.inner.events.warning(format!(
                        "no pending slot for released job {} of '{}'",
                        ack.correlation_id, ack.destination
                    ));
                }
                metrics::record_release(self.name());
                debug!(
                    destination = %ack.destination,
                    correlation_id = %ack.correlation_id,
                    requeued,
                    "Slot released"
                );
                self.inner.events.emit(QueueEvent::Released {
                    destination: ack.destination.clone(),
                    correlation_id: ack.correlation_id.to_string(),
                    requeued,
                });
                Ok(true)
            }
            Ok(ReleaseOutcome::Unknown) => {
                warn!(
                    destination = %ack.destination,
                    token = %ack.id,
                    "Release of unknown ack token ignored"
                );
                self.inner
                    .events
                    .warning(format!("unknown ack token {} for '{}'", ack.id, ack.destination));
                Ok(false)
            }
            Err(e) => {
                error!(destination = %ack.destination, error = %e, "Release failed");
                self.inner
                    .events
                    .error(e.to_string(), Some(ack.correlation_id.to_string()));
                Err(e)
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop every queued job of a destination; jobs in flight finish normally
    pub async fn purge(&self, destination: &str) -> QueueResult<u64> {
        let purged = self.inner.coordinator.purge(destination).await?;
        info!(destination = %destination, purged, "Destination purged");
        Ok(purged)
    }

    /// Occupancy counts, optionally restricted to one destination
    pub async fn stats(&self, destination: Option<&str>) -> QueueResult<QueueStats> {
        let coordinator = &self.inner.coordinator;
        let snapshot = coordinator.snapshot().await?;

        let count = |list: &[String]| -> u64 {
            match destination {
                Some(d) => list.iter().filter(|h| h.as_str() == d).count() as u64,
                None => list.len() as u64,
            }
        };

        let pending = count(&snapshot.pending);
        let total = count(&snapshot.main) + pending;

        let backlog = match destination {
            Some(d) => coordinator.host_queue_len(d).await?,
            None => {
                let mut sum = 0;
                for host in coordinator.destinations().await? {
                    sum += coordinator.host_queue_len(&host).await?;
                }
                sum
            }
        };

        Ok(QueueStats {
            pending,
            total,
            backlog,
        })
    }

    /// Main rotation, oldest available slot first
    pub async fn queued_hosts(&self) -> QueueResult<Vec<String>> {
        Ok(self.inner.coordinator.snapshot().await?.main)
    }

    /// Pending rotation, oldest checkout first
    pub async fn pending_hosts(&self) -> QueueResult<Vec<String>> {
        Ok(self.inner.coordinator.snapshot().await?.pending)
    }

    pub async fn queued_host_counts(&self) -> QueueResult<HostCounts> {
        Ok(count_hosts(&self.queued_hosts().await?))
    }

    pub async fn pending_host_counts(&self) -> QueueResult<HostCounts> {
        Ok(count_hosts(&self.pending_hosts().await?))
    }

    /// Zero-based position at which a queued key would be dispatched
    pub async fn position_in_queue(&self, key: &str) -> QueueResult<Option<usize>> {
        let coordinator = &self.inner.coordinator;
        let snapshot = coordinator.snapshot().await?;

        let mut queues = HashMap::new();
        for host in coordinator.destinations().await? {
            let keys = coordinator
                .host_queue(&host)
                .await?
                .iter()
                .map(|raw| QueueEntry::decode(raw).map(|e| e.key))
                .collect::<QueueResult<VecDeque<_>>>()?;
            queues.insert(host, keys);
        }

        let rotation = snapshot.main.into_iter().chain(snapshot.pending);
        Ok(position::simulate(rotation, queues, key))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop dispatching.
    ///
    /// Interrupts a waiting `next()`. With `wait_for_active_jobs` the call
    /// returns once running callbacks have finished; either way a callback
    /// that finishes after this point is not released and stays recoverable.
    pub async fn close(&self, wait_for_active_jobs: bool) -> QueueResult<()> {
        self.inner
            .wait_for_jobs
            .store(wait_for_active_jobs, Ordering::SeqCst);
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);

        self.inner.shutdown.cancel();
        self.inner.coordinator.wake_waiters();

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if was_active {
            self.inner
                .coordinator
                .retire_instance(&self.inner.instance_id)
                .await?;
            info!(
                queue = %self.inner.config.name,
                instance = %self.inner.instance_id,
                "Fair queue closed"
            );
        }

        Ok(())
    }
}
