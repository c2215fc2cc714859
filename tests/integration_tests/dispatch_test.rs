//! Dispatch tests
//!
//! Fair rotation across destinations, per-destination concurrency limits,
//! queue inspection and shutdown behaviour of `next()`.

use super::fixtures::*;
use async_trait::async_trait;
use fairq::coordinator::{
    AdmitOutcome, AdmitRequest, Checkout, Coordinator, MemoryCoordinator, ReleaseOutcome,
    RotationSnapshot,
};
use fairq::dedup::ExpiringSet;
use fairq::events::QueueEvent;
use fairq::models::{AckToken, QueueStats};
use fairq::{FairQueue, QueueError, QueueResult, UrlPayload};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn path_of(dispatch: &fairq::models::Dispatch<fairq::UrlPayload>) -> String {
    dispatch.payload.url.rsplit('/').next().unwrap_or_default().to_string()
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_single_destination_is_fifo() {
    let (queue, _) = memory_queue().await;
    for i in 1..=6 {
        push_ok(&queue, &url("a.com", &format!("J{i}")), 1).await;
    }

    let mut order = Vec::new();
    for _ in 0..6 {
        let dispatch = next_now(&queue).await;
        order.push(path_of(&dispatch));
        assert!(queue.release(&dispatch.ack).await.unwrap());
    }

    assert_eq!(order, vec!["J1", "J2", "J3", "J4", "J5", "J6"]);
}

#[tokio::test]
async fn test_unshift_jumps_the_queue() {
    let (queue, _) = memory_queue().await;
    push_ok(&queue, &url("a.com", "1"), 1).await;
    push_ok(&queue, &url("a.com", "2"), 1).await;
    assert!(queue.unshift(&url("a.com", "0"), 1).await.unwrap().is_admitted());

    let mut order = Vec::new();
    for _ in 0..3 {
        let dispatch = next_now(&queue).await;
        order.push(path_of(&dispatch));
        queue.release(&dispatch.ack).await.unwrap();
    }
    assert_eq!(order, vec!["0", "1", "2"]);
}

#[tokio::test]
async fn test_destinations_take_turns() {
    let (queue, _) = memory_queue().await;
    push_ok(&queue, &url("a.com", "A1"), 1).await;
    push_ok(&queue, &url("a.com", "A2"), 1).await;
    push_ok(&queue, &url("b.com", "B1"), 1).await;
    push_ok(&queue, &url("b.com", "B2"), 1).await;

    let a1 = next_now(&queue).await;
    let b1 = next_now(&queue).await;
    assert_eq!(path_of(&a1), "A1");
    assert_eq!(path_of(&b1), "B1");

    // Both destinations are at their limit
    assert!(try_next(&queue).await.is_none());

    queue.release(&a1.ack).await.unwrap();
    let a2 = next_now(&queue).await;
    assert_eq!(path_of(&a2), "A2");
}

#[tokio::test]
async fn test_concurrency_limit_caps_in_flight_jobs() {
    let (queue, _) = memory_queue().await;
    for i in 1..=4 {
        push_ok(&queue, &url("a.com", &format!("A{i}")), 2).await;
    }
    push_ok(&queue, &url("e.com", "E1"), 1).await;

    let first = next_now(&queue).await;
    let second = next_now(&queue).await;
    let third = next_now(&queue).await;
    assert_eq!(
        [path_of(&first), path_of(&second), path_of(&third)],
        ["A1", "A2", "E1"]
    );
    assert!(try_next(&queue).await.is_none());

    let stats = queue.stats(Some("a.com")).await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            pending: 2,
            total: 2,
            backlog: 2
        }
    );

    assert!(queue.release(&first.ack).await.unwrap());
    assert_eq!(path_of(&next_now(&queue).await), "A3");
    assert!(try_next(&queue).await.is_none());
}

// ============================================================================
// Concurrency changes
// ============================================================================

#[tokio::test]
async fn test_concurrency_increase_adds_slots() {
    let (queue, _) = memory_queue().await;
    push_ok(&queue, &url("a.com", "1"), 1).await;
    push_ok(&queue, &url("a.com", "2"), 3).await;
    push_ok(&queue, &url("a.com", "3"), 3).await;
    push_ok(&queue, &url("a.com", "4"), 3).await;

    let counts = queue.queued_host_counts().await.unwrap();
    assert_eq!(counts.get("a.com"), Some(&3));
}

#[tokio::test]
async fn test_concurrency_decrease_rederives_slots() {
    let (queue, _) = memory_queue().await;
    for i in 1..=3 {
        push_ok(&queue, &url("a.com", &i.to_string()), 3).await;
    }
    assert_eq!(queue.queued_host_counts().await.unwrap().get("a.com"), Some(&3));

    push_ok(&queue, &url("a.com", "4"), 1).await;
    assert_eq!(queue.queued_hosts().await.unwrap(), vec!["a.com"]);

    let first = next_now(&queue).await;
    assert!(try_next(&queue).await.is_none());
    queue.release(&first.ack).await.unwrap();
    assert!(try_next(&queue).await.is_some());
}

#[tokio::test]
async fn test_release_after_concurrency_decrease_is_not_a_warning() {
    let (queue, _) = memory_queue().await;
    for i in 1..=3 {
        push_ok(&queue, &url("a.com", &i.to_string()), 3).await;
    }
    let first = next_now(&queue).await;

    // Strips the in-flight slot of `first` along with the rest
    push_ok(&queue, &url("a.com", "4"), 1).await;
    assert!(queue.pending_hosts().await.unwrap().is_empty());

    let mut events = queue.subscribe();
    assert!(queue.release(&first.ack).await.unwrap());
    assert!(matches!(
        events.recv().await.unwrap(),
        QueueEvent::Released { .. }
    ));
}

// ============================================================================
// Inspection
// ============================================================================

#[tokio::test]
async fn test_position_in_queue_follows_rotation() {
    let (queue, _) = memory_queue().await;
    for i in 0..3 {
        push_ok(&queue, &url("a.com", &format!("a{i}")), 1).await;
    }
    for i in 0..4 {
        push_ok(&queue, &url("b.com", &format!("b{i}")), 1).await;
    }

    let expected = [
        ("a.com/a0", 0),
        ("b.com/b0", 1),
        ("a.com/a1", 2),
        ("b.com/b1", 3),
        ("a.com/a2", 4),
        ("b.com/b2", 5),
        ("b.com/b3", 6),
    ];
    for (path, position) in expected {
        let key = format!("https://{path}");
        assert_eq!(
            queue.position_in_queue(&key).await.unwrap(),
            Some(position),
            "position of {key}"
        );
    }

    assert_eq!(queue.position_in_queue("https://c.com/x").await.unwrap(), None);
}

#[tokio::test]
async fn test_purge_drops_backlog_but_not_in_flight() {
    let (queue, _) = memory_queue().await;
    push_ok(&queue, &url("a.com", "1"), 1).await;
    push_ok(&queue, &url("a.com", "2"), 1).await;
    push_ok(&queue, &url("a.com", "3"), 1).await;
    push_ok(&queue, &url("b.com", "1"), 1).await;

    let in_flight = next_now(&queue).await;
    assert_eq!(in_flight.destination, "a.com");

    assert_eq!(queue.purge("a.com").await.unwrap(), 2);
    assert_eq!(queue.queued_hosts().await.unwrap(), vec!["b.com"]);
    assert_eq!(queue.pending_hosts().await.unwrap(), vec!["a.com"]);

    let stats = queue.stats(None).await.unwrap();
    assert_eq!(stats.backlog, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total, 2);

    // Purged keys may be pushed again
    push_ok(&queue, &url("a.com", "2"), 1).await;

    assert!(queue.release(&in_flight.ack).await.unwrap());
    assert!(queue.pending_hosts().await.unwrap().is_empty());
}

// ============================================================================
// Release and shutdown
// ============================================================================

#[tokio::test]
async fn test_release_of_unknown_token_is_a_warning() {
    let (queue, _) = memory_queue().await;
    let mut events = queue.subscribe();

    let bogus = AckToken {
        id: "no-such-token".to_string(),
        destination: "a.com".to_string(),
        correlation_id: "nope".into(),
    };
    assert!(!queue.release(&bogus).await.unwrap());

    let event = events.recv().await.unwrap();
    assert!(matches!(event, QueueEvent::Warning { .. }));
    assert!(queue.queued_hosts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_release_emits_event() {
    let (queue, _) = memory_queue().await;
    push_ok(&queue, &url("a.com", "1"), 1).await;
    push_ok(&queue, &url("a.com", "2"), 1).await;
    let mut events = queue.subscribe();

    let dispatch = next_now(&queue).await;
    queue.release(&dispatch.ack).await.unwrap();

    match events.recv().await.unwrap() {
        QueueEvent::Released {
            destination,
            correlation_id,
            requeued,
        } => {
            assert_eq!(destination, "a.com");
            assert_eq!(correlation_id, dispatch.correlation_id.to_string());
            assert!(requeued);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_release_without_pending_slot_is_reported() {
    let (queue, coordinator) = memory_queue().await;
    push_ok(&queue, &url("a.com", "1"), 2).await;
    push_ok(&queue, &url("a.com", "2"), 2).await;
    let first = next_now(&queue).await;

    // A second slot is taken, then its destination is purged and drained
    let slot = coordinator
        .acquire_slot(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(slot.as_deref(), Some("a.com"));
    assert_eq!(queue.purge("a.com").await.unwrap(), 1);
    let drained = coordinator
        .checkout("a.com", queue.instance_id(), "other", 0)
        .await
        .unwrap();
    assert_eq!(drained, Checkout::Drained);

    let mut events = queue.subscribe();
    assert!(queue.release(&first.ack).await.unwrap());
    assert!(matches!(
        events.recv().await.unwrap(),
        QueueEvent::Warning { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        QueueEvent::Released {
            requeued: false,
            ..
        }
    ));
}

#[tokio::test]
async fn test_close_interrupts_waiting_next() {
    let (queue, _) = memory_queue().await;

    let waiting = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.next().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    queue.close(false).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("next should return after close")
        .unwrap();
    assert!(matches!(result, Err(QueueError::NotActive)));

    assert!(matches!(queue.next().await, Err(QueueError::NotActive)));
}

// ============================================================================
// Checkout failures
// ============================================================================

const STALL: Duration = Duration::from_millis(100);

/// Memory coordinator whose next checkouts fail or stall
#[derive(Default)]
struct FlakyCheckout {
    inner: MemoryCoordinator,
    failures: AtomicUsize,
    stalls: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Coordinator for FlakyCheckout {
    async fn admit(&self, request: &AdmitRequest<'_>) -> QueueResult<AdmitOutcome> {
        self.inner.admit(request).await
    }

    async fn acquire_slot(&self, timeout: Duration) -> QueueResult<Option<String>> {
        self.inner.acquire_slot(timeout).await
    }

    async fn checkout(
        &self,
        destination: &str,
        instance: &str,
        token: &str,
        now_ms: i64,
    ) -> QueueResult<Checkout> {
        if take_one(&self.stalls) {
            tokio::time::sleep(STALL).await;
        }
        if take_one(&self.failures) {
            return Err(QueueError::Pool("connection reset".to_string()));
        }
        self.inner.checkout(destination, instance, token, now_ms).await
    }

    async fn return_slot(&self, destination: &str) -> QueueResult<()> {
        self.inner.return_slot(destination).await
    }

    async fn requeue(&self, instance: &str, token: &str, destination: &str) -> QueueResult<bool> {
        self.inner.requeue(instance, token, destination).await
    }

    async fn release(
        &self,
        instance: &str,
        token: &str,
        destination: &str,
    ) -> QueueResult<ReleaseOutcome> {
        self.inner.release(instance, token, destination).await
    }

    async fn remove(&self, key: &str, tombstone_expires_at: i64) -> QueueResult<bool> {
        self.inner.remove(key, tombstone_expires_at).await
    }

    async fn purge(&self, destination: &str) -> QueueResult<u64> {
        self.inner.purge(destination).await
    }

    async fn register_instance(&self, instance: &str, lease: Duration) -> QueueResult<()> {
        self.inner.register_instance(instance, lease).await
    }

    async fn retire_instance(&self, instance: &str) -> QueueResult<()> {
        self.inner.retire_instance(instance).await
    }

    async fn orphaned_instances(&self, own: &str) -> QueueResult<Vec<String>> {
        self.inner.orphaned_instances(own).await
    }

    async fn recover(&self, instance: &str) -> QueueResult<Vec<String>> {
        self.inner.recover(instance).await
    }

    async fn snapshot(&self) -> QueueResult<RotationSnapshot> {
        self.inner.snapshot().await
    }

    async fn host_queue(&self, destination: &str) -> QueueResult<Vec<String>> {
        self.inner.host_queue(destination).await
    }

    async fn host_queue_len(&self, destination: &str) -> QueueResult<u64> {
        self.inner.host_queue_len(destination).await
    }

    async fn destinations(&self) -> QueueResult<Vec<String>> {
        self.inner.destinations().await
    }

    async fn publish(&self, correlation_id: &str, outcome: &str, ttl: Duration) -> QueueResult<()> {
        self.inner.publish(correlation_id, outcome, ttl).await
    }

    async fn wait_outcome(&self, correlation_id: &str) -> QueueResult<String> {
        self.inner.wait_outcome(correlation_id).await
    }

    fn wake_waiters(&self) {
        self.inner.wake_waiters()
    }

    fn expiring_set(&self, name: &str) -> Arc<dyn ExpiringSet> {
        self.inner.expiring_set(name)
    }
}

async fn flaky_queue(flaky: FlakyCheckout) -> (FairQueue<UrlPayload>, Arc<FlakyCheckout>) {
    let coordinator = Arc::new(flaky);
    let queue = FairQueue::with_coordinator(test_config(), coordinator.clone())
        .await
        .unwrap();
    (queue, coordinator)
}

#[tokio::test]
async fn test_failed_checkout_returns_its_slot() {
    let (queue, coordinator) = flaky_queue(FlakyCheckout {
        failures: AtomicUsize::new(1),
        ..Default::default()
    })
    .await;
    push_ok(&queue, &url("a.com", "1"), 1).await;

    let err = queue.next().await.unwrap_err();
    assert!(matches!(err, QueueError::Pool(_)));

    let snapshot = coordinator.snapshot().await.unwrap();
    assert_eq!(snapshot.main, vec!["a.com"]);
    assert!(snapshot.pending.is_empty());

    let dispatch = next_now(&queue).await;
    assert_eq!(path_of(&dispatch), "1");
}

#[tokio::test]
async fn test_next_dropped_during_checkout_requeues_job() {
    let (queue, coordinator) = flaky_queue(FlakyCheckout {
        stalls: AtomicUsize::new(1),
        ..Default::default()
    })
    .await;
    push_ok(&queue, &url("a.com", "1"), 1).await;
    push_ok(&queue, &url("a.com", "2"), 1).await;

    let abandoned = tokio::time::timeout(STALL / 4, queue.next()).await;
    assert!(abandoned.is_err());

    // The stalled checkout completes on its own and puts the job back
    tokio::time::sleep(STALL * 2).await;
    assert!(coordinator.inner.inflight_tokens(queue.instance_id()).is_empty());
    let snapshot = coordinator.snapshot().await.unwrap();
    assert_eq!(snapshot.main, vec!["a.com"]);
    assert!(snapshot.pending.is_empty());

    let dispatch = next_now(&queue).await;
    assert_eq!(path_of(&dispatch), "1");
}

// ============================================================================
// Property tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// However jobs are spread, no destination ever has more jobs in flight
    /// than its limit, and every job runs exactly once in per-destination order.
    #[test]
    fn prop_in_flight_never_exceeds_limit(
        jobs in prop::collection::vec(0usize..3, 1..20),
        limits in prop::array::uniform3(1u32..4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (queue, _) = memory_queue().await;
            let hosts = ["a.com", "b.com", "c.com"];
            let mut expected: HashMap<&str, Vec<String>> = HashMap::new();

            for (i, host) in jobs.iter().enumerate() {
                let path = format!("job{i}");
                push_ok(&queue, &url(hosts[*host], &path), limits[*host]).await;
                expected.entry(hosts[*host]).or_default().push(path);
            }

            let mut seen: HashMap<String, Vec<String>> = HashMap::new();
            loop {
                let mut round = Vec::new();
                while let Ok(Ok(dispatch)) =
                    tokio::time::timeout(Duration::from_millis(20), queue.next()).await
                {
                    round.push(dispatch);
                }
                if round.is_empty() {
                    break;
                }

                let mut per_host: HashMap<&str, u32> = HashMap::new();
                for dispatch in &round {
                    *per_host.entry(dispatch.destination.as_str()).or_default() += 1;
                }
                for (host, count) in &per_host {
                    let limit = limits[hosts.iter().position(|h| h == host).unwrap()];
                    assert!(*count <= limit, "{host} ran {count} jobs with limit {limit}");
                }

                for dispatch in round {
                    seen.entry(dispatch.destination.clone())
                        .or_default()
                        .push(path_of(&dispatch));
                    assert!(queue.release(&dispatch.ack).await.unwrap());
                }
            }

            for (host, paths) in expected {
                assert_eq!(seen.get(host), Some(&paths));
            }
        });
    }
}
