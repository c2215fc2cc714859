//! Result correlation tests
//!
//! A producer waits on the correlation id returned by `push` while a worker
//! processes the job and publishes its outcome.

use super::fixtures::*;
use fairq::models::{EventType, Outcome};
use fairq::{QueueError, UrlPayload, WaitOptions};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn within(timeout: Duration) -> WaitOptions {
    WaitOptions::new().with_timeout(timeout)
}

#[tokio::test]
async fn test_wait_for_successful_outcome() {
    let (queue, _) = memory_queue().await;
    let worker = queue
        .process(2, |job: UrlPayload| async move {
            Ok::<_, std::io::Error>(json!({ "length": job.url.len() }))
        })
        .unwrap();

    let job = url("a.com", "page");
    let admission = queue.push(&job, 1).await.unwrap();
    let id = admission.correlation_id().unwrap();

    let outcome = queue.wait_for(id, within(Duration::from_secs(5))).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(&outcome.correlation_id, id);
    assert_eq!(outcome.result, Some(json!({ "length": job.url.len() })));
    assert_eq!(outcome.payload_as::<UrlPayload>().unwrap(), job);

    queue.close(true).await.unwrap();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wait_for_failed_outcome() {
    let (queue, _) = memory_queue().await;
    let worker = queue
        .process(1, |_job: UrlPayload| async move {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .unwrap();

    let admission = queue.push(&url("a.com", "fails"), 1).await.unwrap();
    let id = admission.correlation_id().unwrap();

    let outcome = queue.wait_for(id, within(Duration::from_secs(5))).await.unwrap();
    assert_eq!(outcome.event_type, EventType::Error);
    let error = outcome.error.expect("error details");
    assert_eq!(error.name, "Error");
    assert_eq!(error.message, "boom");

    // Failed jobs are still released
    queue.close(true).await.unwrap();
    worker.await.unwrap().unwrap();
    assert_eq!(queue.stats(None).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_wait_for_times_out() {
    let (queue, coordinator) = memory_queue().await;
    let id = "never-published".into();

    let started = Instant::now();
    let err = queue
        .wait_for(&id, within(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(coordinator.active_waiters(), 0);
}

#[tokio::test]
async fn test_wait_for_can_be_aborted() {
    let (queue, coordinator) = memory_queue().await;
    let id = "aborted".into();
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        })
    };

    let err = queue
        .wait_for(&id, WaitOptions::new().with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Aborted { .. }));
    assert_eq!(coordinator.active_waiters(), 0);
    canceller.await.unwrap();

    // A fresh wait on the same id still works
    let outcome = Outcome::success(id.clone(), json!({}), json!("late"));
    queue.publish(&outcome).await.unwrap();
    let received = queue.wait_for(&id, within(Duration::from_secs(1))).await.unwrap();
    assert_eq!(received, outcome);
    assert_eq!(coordinator.active_waiters(), 0);
}

#[tokio::test]
async fn test_outcome_published_before_wait_is_delivered() {
    let (queue, _) = memory_queue().await;
    let id = "early".into();
    let outcome = Outcome::success(id, json!({ "url": "https://a.com/" }), json!(1));

    queue.publish(&outcome).await.unwrap();
    let received = queue
        .wait_for(&outcome.correlation_id, within(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(received, outcome);
}

#[tokio::test]
async fn test_concurrent_waiters_on_one_id_are_not_aborted() {
    let (queue, coordinator) = memory_queue().await;
    let id: fairq::CorrelationId = "shared".into();

    let spawn_wait = || {
        let queue = queue.clone();
        let id = id.clone();
        tokio::spawn(async move { queue.wait_for(&id, within(Duration::from_secs(2))).await })
    };
    let first = spawn_wait();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = spawn_wait();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!first.is_finished(), "first waiter must keep waiting");
    assert_eq!(coordinator.active_waiters(), 2);

    let one = Outcome::success(id.clone(), json!({}), json!(1));
    let two = Outcome::success(id.clone(), json!({}), json!(2));
    queue.publish(&one).await.unwrap();
    queue.publish(&two).await.unwrap();

    assert_eq!(first.await.unwrap().unwrap(), one);
    assert_eq!(second.await.unwrap().unwrap(), two);
    assert_eq!(coordinator.active_waiters(), 0);
}
