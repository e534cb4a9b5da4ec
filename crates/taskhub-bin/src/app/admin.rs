//! Operator commands: dead letters, statistics, retention and manual enqueue.

use super::AppResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use taskhub_database::AsyncDatabase;
use taskhub_outbox::{
    enqueue, outbox_stats, purge_processed, DeadLetterAdmin, DeadLetterFilter, DeadLetterRecord,
    Pagination,
};

/// Printable dead letter; the payload is shown as text.
#[derive(Debug, Serialize)]
struct DeadLetterView {
    id: String,
    original_record_id: String,
    event_type: String,
    idempotency_key: Option<String>,
    original_created_at: DateTime<Utc>,
    moved_to_dead_letter_at: DateTime<Utc>,
    total_retry_attempts: u32,
    last_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl DeadLetterView {
    fn new(record: DeadLetterRecord, with_payload: bool) -> Self {
        let payload = with_payload.then(|| String::from_utf8_lossy(&record.payload).into_owned());
        Self {
            id: record.id,
            original_record_id: record.original_record_id,
            event_type: record.event_type,
            idempotency_key: record.idempotency_key,
            original_created_at: record.original_created_at,
            moved_to_dead_letter_at: record.moved_to_dead_letter_at,
            total_retry_attempts: record.total_retry_attempts,
            last_error: record.last_error,
            payload,
        }
    }
}

pub async fn list_dead_letters(
    db: AsyncDatabase,
    event_type: Option<String>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
    limit: usize,
    offset: usize,
) -> AppResult<()> {
    let filter = DeadLetterFilter {
        event_type,
        moved_after: after,
        moved_before: before,
    };
    let page = DeadLetterAdmin::new(db)
        .list(filter, Pagination { limit, offset })
        .await?;

    let shown = page.records.len();
    let views: Vec<DeadLetterView> = page
        .records
        .into_iter()
        .map(|r| DeadLetterView::new(r, false))
        .collect();
    println!("{}", serde_json::to_string_pretty(&views)?);
    println!("showing {shown} of {} (offset {offset})", page.total);
    Ok(())
}

pub async fn show_dead_letter(db: AsyncDatabase, id: &str) -> AppResult<()> {
    match DeadLetterAdmin::new(db).get(id).await? {
        Some(record) => {
            let view = DeadLetterView::new(record, true);
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        None => Err(format!("dead letter not found: {id}").into()),
    }
}

pub async fn retry_dead_letter(db: AsyncDatabase, id: &str) -> AppResult<()> {
    let record = DeadLetterAdmin::new(db).retry(id).await?;
    println!("re-enqueued {id} as outbox record {}", record.id);
    Ok(())
}

pub async fn delete_dead_letter(db: AsyncDatabase, id: &str) -> AppResult<()> {
    DeadLetterAdmin::new(db).delete(id).await?;
    println!("deleted {id}");
    Ok(())
}

pub async fn print_stats(db: AsyncDatabase) -> AppResult<()> {
    let stats = outbox_stats(&db, Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub async fn purge(db: AsyncDatabase, older_than_days: u32) -> AppResult<()> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    let purged = purge_processed(&db, cutoff).await?;
    println!("purged {purged} processed records older than {cutoff}");
    Ok(())
}

pub async fn enqueue_json(
    db: AsyncDatabase,
    event_type: String,
    payload: String,
    key: Option<String>,
) -> AppResult<()> {
    serde_json::from_str::<serde_json::Value>(&payload)
        .map_err(|e| format!("payload is not valid JSON: {e}"))?;

    let id = db
        .transaction(move |tx| enqueue(tx, &event_type, payload.as_bytes(), key.as_deref()))
        .await?;
    println!("enqueued {id}");
    Ok(())
}
