//! Statistics and retention.

use crate::OutboxResult;
use chrono::{DateTime, Utc};
use taskhub_database::{queries, AsyncDatabase, OutboxStats};
use tracing::info;

/// Record counts per state, with claims evaluated as of `now`.
pub async fn outbox_stats(db: &AsyncDatabase, now: DateTime<Utc>) -> OutboxResult<OutboxStats> {
    let stats = db
        .call(move |conn| queries::get_outbox_stats(conn, now))
        .await?;
    Ok(stats)
}

/// Delete processed records older than `before`. Returns the number removed.
///
/// Duplicate suppression only sees processed records that still exist, so
/// the retention window bounds how far back an idempotency key is honoured.
pub async fn purge_processed(db: &AsyncDatabase, before: DateTime<Utc>) -> OutboxResult<usize> {
    let purged = db
        .call(move |conn| queries::purge_processed_outbox_records(conn, before))
        .await?;
    if purged > 0 {
        info!(purged, before = %before, "Purged processed outbox records");
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueue::enqueue;
    use chrono::Duration;

    #[tokio::test]
    async fn purge_keeps_unprocessed_and_recent() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let old = db
            .transaction(|tx| enqueue(tx, "task.created", b"{}", None))
            .await
            .unwrap();
        let recent = db
            .transaction(|tx| enqueue(tx, "task.created", b"{}", None))
            .await
            .unwrap();
        db.transaction(|tx| enqueue(tx, "task.created", b"{}", None))
            .await
            .unwrap();

        let now = Utc::now();
        let claim = taskhub_database::OutboxClaim {
            worker_id: "w1".to_string(),
            now,
            claimed_until: now + Duration::minutes(5),
            limit: 2,
        };
        db.transaction(move |tx| queries::claim_due_outbox_records(tx, &claim))
            .await
            .unwrap();
        db.call(move |conn| {
            queries::mark_outbox_record_processed(conn, &old, "w1", now - Duration::days(10))?;
            queries::mark_outbox_record_processed(conn, &recent, "w1", now - Duration::hours(1))
        })
        .await
        .unwrap();

        let purged = purge_processed(&db, now - Duration::days(7)).await.unwrap();
        assert_eq!(purged, 1);

        let stats = outbox_stats(&db, now).await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dead_lettered, 0);
    }
}
