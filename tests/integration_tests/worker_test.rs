//! Worker loop tests

use super::fixtures::*;
use fairq::events::QueueEvent;
use fairq::models::EventType;
use fairq::{QueueError, UrlPayload, WaitOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn test_worker_processes_every_job() {
    let (queue, _) = memory_queue().await;
    for host in ["a.com", "b.com", "c.com"] {
        for i in 0..3 {
            push_ok(&queue, &url(host, &i.to_string()), 1).await;
        }
    }

    let done = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(Notify::new());
    let worker = {
        let done = Arc::clone(&done);
        let finished = Arc::clone(&finished);
        queue
            .process(3, move |_job: UrlPayload| {
                let done = Arc::clone(&done);
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if done.fetch_add(1, Ordering::SeqCst) + 1 == 9 {
                        finished.notify_one();
                    }
                    Ok::<_, std::convert::Infallible>(())
                }
            })
            .unwrap()
    };

    tokio::time::timeout(Duration::from_secs(5), finished.notified())
        .await
        .expect("all jobs should finish");

    queue.close(true).await.unwrap();
    worker.await.unwrap().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 9);

    let stats = queue.stats(None).await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.backlog, 0);
}

#[tokio::test]
async fn test_worker_concurrency_is_bounded() {
    let (queue, _) = memory_queue().await;
    for i in 0..8 {
        push_ok(&queue, &url("a.com", &i.to_string()), 10).await;
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let worker = {
        let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
        queue
            .process(2, move |_job: UrlPayload| {
                let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(())
                }
            })
            .unwrap()
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while done.load(Ordering::SeqCst) < 8 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    queue.close(true).await.unwrap();
    worker.await.unwrap().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 8);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_panicking_callback_is_isolated() {
    let (queue, _) = memory_queue().await;
    let mut events = queue.subscribe();

    let worker = queue
        .process(1, |job: UrlPayload| async move {
            if job.url.ends_with("bad") {
                panic!("callback exploded");
            }
            Ok::<_, std::convert::Infallible>(job.url)
        })
        .unwrap();

    let bad = queue.push(&url("a.com", "bad"), 1).await.unwrap();
    let good = queue.push(&url("a.com", "good"), 1).await.unwrap();
    let wait = || WaitOptions::new().with_timeout(Duration::from_secs(5));

    let failed = queue.wait_for(bad.correlation_id().unwrap(), wait()).await.unwrap();
    assert_eq!(failed.event_type, EventType::Error);
    let error = failed.error.unwrap();
    assert_eq!(error.name, "Panic");
    assert_eq!(error.message, "callback exploded");

    let succeeded = queue.wait_for(good.correlation_id().unwrap(), wait()).await.unwrap();
    assert!(succeeded.is_success());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Error { correlation_id, .. } = event {
            saw_error |= correlation_id.as_deref() == bad.correlation_id().map(|c| c.as_str());
        }
    }
    assert!(saw_error, "panic should be reported as an error event");

    queue.close(true).await.unwrap();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_jobs_finishing_after_close_stay_in_flight() {
    let (queue, coordinator) = memory_queue().await;
    let started = Arc::new(Notify::new());
    let proceed = Arc::new(Notify::new());

    let worker = {
        let (started, proceed) = (started.clone(), proceed.clone());
        queue
            .process(1, move |_job: UrlPayload| {
                let (started, proceed) = (started.clone(), proceed.clone());
                async move {
                    started.notify_one();
                    proceed.notified().await;
                    Ok::<_, std::convert::Infallible>(())
                }
            })
            .unwrap()
    };

    push_ok(&queue, &url("a.com", "slow"), 1).await;
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("job should start");

    let closing = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.close(true).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    proceed.notify_one();

    closing.await.unwrap().unwrap();
    worker.await.unwrap().unwrap();

    // Not released: a later wake-up hands it out again
    assert_eq!(coordinator.inflight_tokens(queue.instance_id()).len(), 1);
    let successor = queue_on(&coordinator, test_config()).await;
    assert_eq!(successor.wake_up().await.unwrap(), 1);
}

#[tokio::test]
async fn test_process_on_closed_queue_fails() {
    let (queue, _) = memory_queue().await;
    queue.close(false).await.unwrap();

    let result = queue.process(1, |_job: UrlPayload| async move {
        Ok::<_, std::convert::Infallible>(())
    });
    assert!(matches!(result, Err(QueueError::NotActive)));
}
