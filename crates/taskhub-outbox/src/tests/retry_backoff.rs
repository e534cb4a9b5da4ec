//! Failure bookkeeping, backoff and eligibility.

use super::harness::{minutes, registry_with, test_config, FlakyHandler, TestHarness, TASK_CREATED};
use crate::WorkerConfig;
use chrono::{DateTime, Utc};

fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    // Stored timestamps are truncated to whole milliseconds.
    let drift = actual - expected;
    assert!(
        drift > -chrono::Duration::milliseconds(1) && drift < chrono::Duration::seconds(5),
        "expected {expected}, got {actual}"
    );
}

#[tokio::test]
async fn failures_schedule_two_then_four_minutes() {
    let harness = TestHarness::in_memory().await;
    let handler = FlakyHandler::always_failing();
    let worker = harness.worker(registry_with(TASK_CREATED, handler.clone()), test_config("w1"));

    let id = harness.enqueue(TASK_CREATED, b"{}", Some("k1")).await;
    let t0 = Utc::now();

    worker.run_cycle(t0).await.unwrap();
    let record = harness.record(&id).await.unwrap();
    assert_eq!(record.retry_count, 1);
    assert_close(record.next_retry_at.unwrap(), t0 + minutes(2));
    assert!(record.processed_at.is_none());
    assert!(record.claimed_by.is_none());

    let t1 = t0 + minutes(3);
    worker.run_cycle(t1).await.unwrap();
    let record = harness.record(&id).await.unwrap();
    assert_eq!(record.retry_count, 2);
    assert_close(record.next_retry_at.unwrap(), t1 + minutes(4));

    let t2 = t1 + minutes(5);
    let report = worker.run_cycle(t2).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(harness.record(&id).await.is_none());

    let dead = harness.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].total_retry_attempts, 3);
    assert_eq!(dead[0].idempotency_key.as_deref(), Some("k1"));
    assert_close(dead[0].moved_to_dead_letter_at, t2);
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn record_is_not_claimed_before_next_retry_at() {
    let harness = TestHarness::in_memory().await;
    let handler = FlakyHandler::always_failing();
    let worker = harness.worker(registry_with(TASK_CREATED, handler.clone()), test_config("w1"));

    harness.enqueue(TASK_CREATED, b"{}", None).await;
    let t0 = Utc::now();
    worker.run_cycle(t0).await.unwrap();

    for offset in [0, 1] {
        let report = worker.run_cycle(t0 + minutes(offset)).await.unwrap();
        assert!(report.is_idle());
    }
    assert_eq!(handler.calls(), 1);

    let report = worker.run_cycle(t0 + minutes(2) + chrono::Duration::seconds(5)).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn one_failure_does_not_block_the_batch() {
    let harness = TestHarness::in_memory().await;
    let handler = FlakyHandler::failing(1);
    let config = WorkerConfig {
        max_concurrency: 1,
        ..test_config("w1")
    };
    let worker = harness.worker(registry_with(TASK_CREATED, handler.clone()), config);

    let failed = harness.enqueue(TASK_CREATED, b"{}", None).await;
    let delivered = harness.enqueue(TASK_CREATED, b"{}", None).await;

    let report = worker.run_cycle(Utc::now()).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(harness.record(&failed).await.unwrap().retry_count, 1);
    assert!(harness.record(&delivered).await.unwrap().processed_at.is_some());
}

#[tokio::test]
async fn custom_retry_budget_is_honoured() {
    let harness = TestHarness::in_memory().await;
    let config = WorkerConfig {
        max_retries: 1,
        ..test_config("w1")
    };
    let worker = harness.worker(registry_with(TASK_CREATED, FlakyHandler::always_failing()), config);

    harness.enqueue(TASK_CREATED, b"{}", None).await;
    let report = worker.run_cycle(Utc::now()).await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(harness.dead_letters().await[0].total_retry_attempts, 1);
}
