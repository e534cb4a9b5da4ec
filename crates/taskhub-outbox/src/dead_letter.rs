//! Operator actions on dead letters.

use crate::{OutboxError, OutboxResult};
use chrono::Utc;
use taskhub_database::{
    queries, AsyncDatabase, DeadLetterFilter, DeadLetterPage, DeadLetterRecord, OutboxRecord,
    Pagination,
};
use tracing::info;
use uuid::Uuid;

/// List, inspect, replay and discard dead letters.
///
/// Safe to use while workers are running: replay inserts a brand-new outbox
/// record and deletes the dead letter in one transaction.
#[derive(Clone)]
pub struct DeadLetterAdmin {
    db: AsyncDatabase,
}

impl DeadLetterAdmin {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Dead letters matching `filter`, most recently moved first.
    pub async fn list(
        &self,
        filter: DeadLetterFilter,
        page: Pagination,
    ) -> OutboxResult<DeadLetterPage> {
        let page = self
            .db
            .call(move |conn| queries::list_dead_letters(conn, &filter, page))
            .await?;
        Ok(page)
    }

    pub async fn get(&self, id: &str) -> OutboxResult<Option<DeadLetterRecord>> {
        let id = id.to_string();
        let record = self
            .db
            .call(move |conn| queries::get_dead_letter(conn, &id))
            .await?;
        Ok(record)
    }

    /// Re-enqueue a dead letter as a fresh outbox record.
    ///
    /// The new record keeps the event type, payload and idempotency key,
    /// starts with `retry_count = 0` and is due immediately. The dead letter
    /// is deleted.
    pub async fn retry(&self, id: &str) -> OutboxResult<OutboxRecord> {
        let dead_letter_id = id.to_string();
        let new_record_id = Uuid::new_v4().to_string();
        let replayed = self
            .db
            .transaction(move |tx| {
                queries::replay_dead_letter(tx, &dead_letter_id, &new_record_id, Utc::now())
            })
            .await?;

        match replayed {
            Some(record) => {
                info!(
                    dead_letter_id = %id,
                    record_id = %record.id,
                    event_type = %record.event_type,
                    "Dead letter re-enqueued"
                );
                Ok(record)
            }
            None => Err(OutboxError::DeadLetterNotFound(id.to_string())),
        }
    }

    /// Permanently discard a dead letter.
    pub async fn delete(&self, id: &str) -> OutboxResult<()> {
        let dead_letter_id = id.to_string();
        let deleted = self
            .db
            .call(move |conn| queries::delete_dead_letter(conn, &dead_letter_id))
            .await?;

        if !deleted {
            return Err(OutboxError::DeadLetterNotFound(id.to_string()));
        }
        info!(dead_letter_id = %id, "Dead letter deleted");
        Ok(())
    }
}
