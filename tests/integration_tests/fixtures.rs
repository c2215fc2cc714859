//! Shared helpers for queue integration tests

use fairq::coordinator::MemoryCoordinator;
use fairq::models::Dispatch;
use fairq::{FairQueue, QueueConfig, UrlPayload};
use std::sync::Arc;
use std::time::Duration;

/// How long a test waits before concluding that `next()` is blocked
pub const BLOCKED: Duration = Duration::from_millis(150);

/// Short timeouts so closing and blocking tests finish quickly
pub fn test_config() -> QueueConfig {
    QueueConfig::new("test")
        .with_block_timeout(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_stale_interval(Duration::from_secs(5))
}

/// Queue on a fresh in-memory coordinator
pub async fn memory_queue() -> (FairQueue<UrlPayload>, MemoryCoordinator) {
    let coordinator = MemoryCoordinator::new();
    let queue = queue_on(&coordinator, test_config()).await;
    (queue, coordinator)
}

/// Another instance on an existing coordinator
pub async fn queue_on(coordinator: &MemoryCoordinator, config: QueueConfig) -> FairQueue<UrlPayload> {
    FairQueue::with_coordinator(config, Arc::new(coordinator.clone()))
        .await
        .expect("queue should start")
}

pub fn url(host: &str, path: &str) -> UrlPayload {
    UrlPayload::new(format!("https://{host}/{path}"))
}

/// Next dispatch, or `None` if nothing arrives within [`BLOCKED`]
pub async fn try_next(queue: &FairQueue<UrlPayload>) -> Option<Dispatch<UrlPayload>> {
    match tokio::time::timeout(BLOCKED, queue.next()).await {
        Ok(result) => Some(result.expect("next should succeed")),
        Err(_) => None,
    }
}

/// Next dispatch, failing the test if none arrives
pub async fn next_now(queue: &FairQueue<UrlPayload>) -> Dispatch<UrlPayload> {
    try_next(queue).await.expect("a job should be available")
}

/// Push a job with the given concurrency and assert it was admitted
pub async fn push_ok(queue: &FairQueue<UrlPayload>, payload: &UrlPayload, concurrency: u32) {
    let admission = queue.push(payload, concurrency).await.expect("push should succeed");
    assert!(admission.is_admitted(), "{} should be admitted", payload.url);
}
