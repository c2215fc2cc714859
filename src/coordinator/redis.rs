//! Redis-backed coordinator
//!
//! Non-blocking commands and scripts go through a `deadpool-redis` pool.
//! Blocking commands never do: the slot wait (`BLMOVE`) runs on one dedicated
//! connection per coordinator, and every outcome waiter (`BLPOP`) opens its
//! own connection that is dropped with the wait.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use super::scripts::Scripts;
use super::{
    AdmitOutcome, AdmitRequest, Checkout, Coordinator, KeySpace, ReleaseOutcome,
    RotationSnapshot, DEDUP_SET, TOMBSTONE_SET,
};
use crate::config::RedisConfig;
use crate::dedup::{score, ExpiringSet};
use crate::error::{QueueError, QueueResult};
use crate::models::Placement;
use crate::utils::now_ms;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Server-side `BLPOP` timeout of one outcome poll, in seconds
const OUTCOME_POLL_SECS: f64 = 1.0;

/// Coordinator backed by a Redis server (6.2 or newer)
#[derive(Clone)]
pub struct RedisCoordinator {
    pool: Pool,
    client: redis::Client,
    keys: KeySpace,
    scripts: Arc<Scripts>,
    blocking: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinator")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisCoordinator {
    /// Connect to Redis and verify the connection
    pub async fn connect(config: &RedisConfig, namespace: &str) -> QueueResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| QueueError::config(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| QueueError::config(format!("Failed to create Redis pool: {e}")))?;

        let client = redis::Client::open(config.url.as_str())?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        tracing::info!(url = %config.url, namespace = %namespace, "Connected to Redis");

        Ok(Self {
            pool,
            client,
            keys: KeySpace::new(namespace),
            scripts: Arc::new(Scripts::new()),
            blocking: Arc::new(Mutex::new(None)),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// One `BLMOVE` on the dedicated blocking connection
    async fn blmove(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let mut guard = self.blocking.lock().await;

        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };

        let result: redis::RedisResult<Option<String>> = redis::cmd("BLMOVE")
            .arg(self.keys.main())
            .arg(self.keys.pending())
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(conn)
            .await;

        match result {
            Ok(host) => Ok(host),
            Err(e) => {
                // reconnect on the next wait
                *guard = None;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn admit(&self, request: &AdmitRequest<'_>) -> QueueResult<AdmitOutcome> {
        let mut conn = self.pool.get().await?;
        let placement = match request.placement {
            Placement::Back => "back",
            Placement::Front => "front",
        };

        let (status, length): (i64, i64) = self
            .scripts
            .admit
            .key(self.keys.set(DEDUP_SET))
            .key(self.keys.keys())
            .key(self.keys.host_queue(request.destination))
            .key(self.keys.main())
            .key(self.keys.pending())
            .key(self.keys.concurrency())
            .key(self.keys.hosts())
            .arg(request.key)
            .arg(request.correlation_id)
            .arg(request.entry)
            .arg(request.destination)
            .arg(request.concurrency)
            .arg(placement)
            .arg(score(request.dedup_expires_at))
            .arg(request.max_queue_length.unwrap_or(0))
            .arg(request.now_ms)
            .invoke_async(&mut *conn)
            .await?;

        match status {
            1 => Ok(AdmitOutcome::Admitted),
            0 => Ok(AdmitOutcome::Duplicate),
            -1 => Ok(AdmitOutcome::QueueFull {
                length: length.max(0) as u64,
            }),
            other => Err(QueueError::sanity(format!(
                "admit returned unexpected status {other}"
            ))),
        }
    }

    async fn acquire_slot(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();

        // Detached so a dropped caller cannot abandon a slot already moved to
        // Pending; an unclaimed slot is handed back.
        tokio::spawn(async move {
            let result = this.blmove(timeout).await;
            if let Err(Ok(Some(host))) = tx.send(result) {
                if let Err(e) = this.return_slot(&host).await {
                    tracing::warn!(error = %e, host = %host, "Failed to return unclaimed slot");
                }
            }
        });

        rx.await
            .map_err(|_| QueueError::sanity("slot wait task ended without a reply"))?
    }

    async fn checkout(
        &self,
        destination: &str,
        instance: &str,
        token: &str,
        now_ms: i64,
    ) -> QueueResult<Checkout> {
        let mut conn = self.pool.get().await?;

        let (status, raw): (i64, Option<String>) = self
            .scripts
            .checkout
            .key(self.keys.host_queue(destination))
            .key(self.keys.main())
            .key(self.keys.pending())
            .key(self.keys.concurrency())
            .key(self.keys.hosts())
            .key(self.keys.set(TOMBSTONE_SET))
            .key(self.keys.inflight(instance))
            .arg(destination)
            .arg(token)
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await?;

        match (status, raw) {
            (0, _) => Ok(Checkout::Drained),
            (1, Some(raw)) => Ok(Checkout::Dispatched(raw)),
            (2, Some(raw)) => Ok(Checkout::Discarded(raw)),
            (other, _) => Err(QueueError::sanity(format!(
                "checkout returned unexpected status {other}"
            ))),
        }
    }

    async fn return_slot(&self, destination: &str) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = self
            .scripts
            .return_slot
            .key(self.keys.main())
            .key(self.keys.pending())
            .arg(destination)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, instance: &str, token: &str, destination: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let requeued: i64 = self
            .scripts
            .requeue
            .key(self.keys.inflight(instance))
            .key(self.keys.host_queue(destination))
            .key(self.keys.main())
            .key(self.keys.pending())
            .key(self.keys.concurrency())
            .key(self.keys.hosts())
            .arg(token)
            .arg(destination)
            .invoke_async(&mut *conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn release(
        &self,
        instance: &str,
        token: &str,
        destination: &str,
    ) -> QueueResult<ReleaseOutcome> {
        let mut conn = self.pool.get().await?;

        let (status, requeued, missing): (i64, i64, i64) = self
            .scripts
            .release
            .key(self.keys.inflight(instance))
            .key(self.keys.keys())
            .key(self.keys.set(DEDUP_SET))
            .key(self.keys.set(TOMBSTONE_SET))
            .key(self.keys.main())
            .key(self.keys.pending())
            .key(self.keys.concurrency())
            .key(self.keys.host_queue(destination))
            .arg(token)
            .arg(destination)
            .invoke_async(&mut *conn)
            .await?;

        match status {
            1 => Ok(ReleaseOutcome::Released {
                requeued: requeued == 1,
                slot_missing: missing == 1,
            }),
            0 => Ok(ReleaseOutcome::Unknown),
            -1 => Err(QueueError::sanity(format!(
                "ack token {token} does not belong to '{destination}'"
            ))),
            other => Err(QueueError::sanity(format!(
                "release returned unexpected status {other}"
            ))),
        }
    }

    async fn remove(&self, key: &str, tombstone_expires_at: i64) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = self
            .scripts
            .remove
            .key(self.keys.keys())
            .key(self.keys.set(DEDUP_SET))
            .key(self.keys.set(TOMBSTONE_SET))
            .arg(key)
            .arg(tombstone_expires_at)
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed == 1)
    }

    async fn purge(&self, destination: &str) -> QueueResult<u64> {
        let mut conn = self.pool.get().await?;
        let purged: u64 = self
            .scripts
            .purge
            .key(self.keys.host_queue(destination))
            .key(self.keys.keys())
            .key(self.keys.set(DEDUP_SET))
            .key(self.keys.main())
            .key(self.keys.hosts())
            .arg(destination)
            .invoke_async(&mut *conn)
            .await?;
        Ok(purged)
    }

    async fn register_instance(&self, instance: &str, lease: Duration) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .sadd(self.keys.instances(), instance)
            .ignore()
            .cmd("SET")
            .arg(self.keys.lease(instance))
            .arg(now_ms())
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn retire_instance(&self, instance: &str) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.keys.lease(instance)).await?;
        Ok(())
    }

    async fn orphaned_instances(&self, own: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let dead: Vec<String> = self
            .scripts
            .orphaned
            .key(self.keys.instances())
            .arg(self.keys.lease(""))
            .arg(own)
            .invoke_async(&mut *conn)
            .await?;
        Ok(dead)
    }

    async fn recover(&self, instance: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let records: Vec<String> = self
            .scripts
            .recover
            .key(self.keys.inflight(instance))
            .key(self.keys.main())
            .key(self.keys.pending())
            .key(self.keys.concurrency())
            .key(self.keys.hosts())
            .key(self.keys.instances())
            .arg(self.keys.host_prefix())
            .arg(instance)
            .invoke_async(&mut *conn)
            .await?;
        Ok(records)
    }

    async fn snapshot(&self) -> QueueResult<RotationSnapshot> {
        let mut conn = self.pool.get().await?;
        let (main, pending): (Vec<String>, Vec<String>) = redis::pipe()
            .lrange(self.keys.main(), 0, -1)
            .lrange(self.keys.pending(), 0, -1)
            .query_async(&mut *conn)
            .await?;
        Ok(RotationSnapshot { main, pending })
    }

    async fn host_queue(&self, destination: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let entries: Vec<String> = conn
            .lrange(self.keys.host_queue(destination), 0, -1)
            .await?;
        Ok(entries)
    }

    async fn host_queue_len(&self, destination: &str) -> QueueResult<u64> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.llen(self.keys.host_queue(destination)).await?;
        Ok(len)
    }

    async fn destinations(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let mut hosts: Vec<String> = conn.smembers(self.keys.hosts()).await?;
        hosts.sort();
        Ok(hosts)
    }

    async fn publish(
        &self,
        correlation_id: &str,
        outcome: &str,
        ttl: Duration,
    ) -> QueueResult<()> {
        let key = self.keys.result(correlation_id);
        let key = &key;
        let pool = &self.pool;
        let ttl_ms = ttl.as_millis() as i64;

        with_retry_if(
            &RetryConfig::reconnect_once(),
            move || async move {
                let mut conn = pool.get().await?;
                let _: () = redis::pipe()
                    .atomic()
                    .rpush(key, outcome)
                    .ignore()
                    .pexpire(key, ttl_ms)
                    .ignore()
                    .query_async(&mut *conn)
                    .await?;
                Ok::<(), QueueError>(())
            },
            QueueError::is_recoverable,
        )
        .await
    }

    async fn wait_outcome(&self, correlation_id: &str) -> QueueResult<String> {
        let key = self.keys.result(correlation_id);
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        loop {
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&key)
                .arg(OUTCOME_POLL_SECS)
                .query_async(&mut conn)
                .await?;

            if let Some((_, outcome)) = popped {
                return Ok(outcome);
            }
        }
    }

    fn wake_waiters(&self) {
        // Slot waits are bounded by their timeout and re-check the active flag.
    }

    fn expiring_set(&self, name: &str) -> Arc<dyn ExpiringSet> {
        Arc::new(RedisSet {
            pool: self.pool.clone(),
            scripts: Arc::clone(&self.scripts),
            key: self.keys.set(name),
        })
    }
}

// ============================================================================
// Expiring Set
// ============================================================================

/// Sorted set of member → expiry score
struct RedisSet {
    pool: Pool,
    scripts: Arc<Scripts>,
    key: String,
}

#[async_trait]
impl ExpiringSet for RedisSet {
    async fn set(&self, key: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let expiry = crate::utils::expiry_ms(now_ms(), ttl);
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(score(expiry))
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn has(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let live: i64 = self
            .scripts
            .set_has
            .key(&self.key)
            .arg(key)
            .arg(now_ms())
            .invoke_async(&mut *conn)
            .await?;
        Ok(live == 1)
    }

    async fn delete(&self, key: &str) -> QueueResult<u64> {
        let mut conn = self.pool.get().await?;
        let removed: u64 = conn.zrem(&self.key, key).await?;
        Ok(removed)
    }

    async fn size(&self) -> QueueResult<u64> {
        let mut conn = self.pool.get().await?;
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(&self.key)
            .arg(format!("({}", now_ms()))
            .arg("+inf")
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn cleanup(&self) -> QueueResult<u64> {
        let mut conn = self.pool.get().await?;
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(now_ms())
            .query_async(&mut *conn)
            .await?;
        Ok(removed)
    }
}
