//! Graceful stop and the background loop.

use super::harness::{registry_with, test_config, RecordingHandler, ShutdownOnFirst, TestHarness, TASK_CREATED};
use crate::WorkerConfig;
use chrono::Utc;
use std::time::Duration;

#[tokio::test]
async fn shutdown_mid_batch_releases_unattempted_records() {
    let harness = TestHarness::in_memory().await;
    let handler = ShutdownOnFirst::default();
    let config = WorkerConfig {
        max_concurrency: 1,
        ..test_config("stopping")
    };
    let worker = harness.worker(registry_with(TASK_CREATED, handler.clone()), config);
    handler.arm(worker.shutdown_trigger());

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(harness.enqueue(TASK_CREATED, b"{}", None).await);
    }

    let now = Utc::now();
    let report = worker.run_cycle(now).await.unwrap();
    assert_eq!(report.claimed, 5);
    assert_eq!(report.processed, 1);
    assert_eq!(report.abandoned, 4);
    assert_eq!(handler.calls(), 1);

    assert!(harness.record(&ids[0]).await.unwrap().processed_at.is_some());
    for id in &ids[1..] {
        let record = harness.record(id).await.unwrap();
        assert!(record.processed_at.is_none());
        assert_eq!(record.retry_count, 0);
        assert!(record.last_error.is_none());
        assert!(record.claimed_by.is_none());
    }

    let successor = harness.worker(
        registry_with(TASK_CREATED, RecordingHandler::new("search")),
        test_config("successor"),
    );
    let report = successor.run_cycle(now).await.unwrap();
    assert_eq!(report.processed, 4);
}

#[tokio::test]
async fn started_worker_drains_and_stops() {
    let harness = TestHarness::in_memory().await;
    let handler = RecordingHandler::new("search");
    let handle = harness
        .worker(registry_with(TASK_CREATED, handler.clone()), test_config("bg"))
        .start();

    for _ in 0..3 {
        harness.enqueue(TASK_CREATED, b"{}", None).await;
    }

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while handler.calls().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "worker should deliver within the timeout");

    let trigger = handle.trigger();
    handle.shutdown().await;
    assert!(trigger.is_triggered());

    harness.enqueue(TASK_CREATED, b"{}", None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls().len(), 3);
    assert_eq!(harness.stats(Utc::now()).await.pending, 1);
}

#[tokio::test]
async fn trigger_before_start_stops_without_polling() {
    let harness = TestHarness::in_memory().await;
    let handler = RecordingHandler::new("search");
    harness.enqueue(TASK_CREATED, b"{}", None).await;

    let worker = harness.worker(registry_with(TASK_CREATED, handler.clone()), test_config("idle"));
    worker.shutdown_trigger().trigger();
    let handle = worker.start();

    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .unwrap();
    assert!(handler.calls().is_empty());
}
