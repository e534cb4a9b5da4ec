//! Transactional enqueue.
//!
//! Both functions take the caller's open transaction, so an event becomes
//! visible to the worker exactly when the business write that produced it
//! commits, and vanishes with it on rollback.
//!
//! ```ignore
//! db.transaction(move |tx| {
//!     tx.execute("UPDATE tasks SET assignee_id = ?1 WHERE id = ?2", params![user, task])?;
//!     enqueue_event(tx, &TaskAssigned { task_id, assignee_id }, Some(&key))
//! })
//! .await?;
//! ```

use crate::events::DomainEvent;
use chrono::Utc;
use rusqlite::Transaction;
use taskhub_database::{queries, DatabaseError, DatabaseResult, NewOutboxRecord};
use tracing::debug;
use uuid::Uuid;

/// Append an event to the outbox and return its record ID.
///
/// The payload is stored as given. An idempotency key, when present, must
/// not be blank.
pub fn enqueue(
    tx: &Transaction<'_>,
    event_type: &str,
    payload: &[u8],
    idempotency_key: Option<&str>,
) -> DatabaseResult<String> {
    if event_type.trim().is_empty() {
        return Err(DatabaseError::InvalidData("event type must not be empty".to_string()));
    }
    if idempotency_key.is_some_and(|key| key.trim().is_empty()) {
        return Err(DatabaseError::InvalidData(
            "idempotency key must not be blank".to_string(),
        ));
    }

    let record = NewOutboxRecord {
        id: Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        payload: payload.to_vec(),
        idempotency_key: idempotency_key.map(str::to_string),
        created_at: Utc::now(),
    };
    queries::insert_outbox_record(tx, &record)?;

    debug!(
        record_id = %record.id,
        event_type = %record.event_type,
        idempotency_key = ?record.idempotency_key,
        "Enqueued outbox event"
    );
    Ok(record.id)
}

/// Encode `event` as JSON and enqueue it under `E::EVENT_TYPE`.
pub fn enqueue_event<E: DomainEvent>(
    tx: &Transaction<'_>,
    event: &E,
    idempotency_key: Option<&str>,
) -> DatabaseResult<String> {
    let payload = event.encode()?;
    enqueue(tx, E::EVENT_TYPE, &payload, idempotency_key)
}
