//! Standalone query functions.
//!
//! Functions that only need one statement take a `&Connection`. Functions
//! whose statements must commit together take a `&Transaction`, which makes
//! "callable only inside an open transaction" a compile-time property.

use crate::{
    from_millis, to_millis, ClaimRenewal, DatabaseResult, DeadLetterFilter, DeadLetterPage, DeadLetterPromotion,
    DeadLetterRecord, NewOutboxRecord, OutboxClaim, OutboxRecord, OutboxStats, Pagination,
    RetrySchedule,
};
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction};
use tracing::debug;

const OUTBOX_COLUMNS: &str = "id, event_type, payload, idempotency_key, created_at, processed_at, \
     retry_count, last_error, next_retry_at, claimed_by, claimed_until";

const DEAD_LETTER_COLUMNS: &str = "id, original_record_id, event_type, payload, idempotency_key, \
     original_created_at, moved_to_dead_letter_at, total_retry_attempts, last_error";

// ==========================================
// Outbox
// ==========================================

/// Insert a new outbox record as part of the caller's transaction.
pub fn insert_outbox_record(tx: &Transaction<'_>, record: &NewOutboxRecord) -> DatabaseResult<()> {
    tx.execute(
        "INSERT INTO outbox_records (id, event_type, payload, idempotency_key, created_at, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            record.id,
            record.event_type,
            record.payload,
            record.idempotency_key,
            to_millis(record.created_at),
        ],
    )?;
    debug!(record_id = %record.id, event_type = %record.event_type, "Outbox record inserted");
    Ok(())
}

/// Get an outbox record by ID.
pub fn get_outbox_record(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_records WHERE id = ?1"
    ))?;

    match stmt.query_row(params![id], map_outbox_record) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Claim up to `claim.limit` due records for one worker.
///
/// A record is due when it is unprocessed, its `next_retry_at` is null or
/// not after `now`, and nobody holds an unexpired claim on it. A keyed
/// record is also skipped while another record with the same idempotency
/// key is claimed elsewhere. Results are in creation order.
pub fn claim_due_outbox_records(
    tx: &Transaction<'_>,
    claim: &OutboxClaim,
) -> DatabaseResult<Vec<OutboxRecord>> {
    let now_ms = to_millis(claim.now);
    let until_ms = to_millis(claim.claimed_until);

    let mut records = {
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_records o
             WHERE o.processed_at IS NULL
               AND (o.next_retry_at IS NULL OR o.next_retry_at <= ?1)
               AND (o.claimed_until IS NULL OR o.claimed_until <= ?1)
               AND (o.idempotency_key IS NULL OR NOT EXISTS (
                    SELECT 1 FROM outbox_records k
                    WHERE k.idempotency_key = o.idempotency_key
                      AND k.id != o.id
                      AND k.processed_at IS NULL
                      AND k.claimed_until > ?1))
             ORDER BY o.created_at ASC, o.rowid ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![now_ms, claim.limit as i64], map_outbox_record)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut update = tx.prepare_cached(
        "UPDATE outbox_records SET claimed_by = ?1, claimed_until = ?2 WHERE id = ?3",
    )?;
    for record in &mut records {
        update.execute(params![claim.worker_id, until_ms, record.id])?;
        record.claimed_by = Some(claim.worker_id.clone());
        record.claimed_until = Some(from_millis(until_ms));
    }

    debug!(worker_id = %claim.worker_id, count = records.len(), "Claimed outbox records");
    Ok(records)
}

/// Check whether any record carrying `key` has already been processed.
pub fn is_idempotency_key_processed(conn: &Connection, key: &str) -> DatabaseResult<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM outbox_records
            WHERE idempotency_key = ?1 AND processed_at IS NOT NULL
         )",
        params![key],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Push out the lease on a record the worker is about to dispatch.
///
/// Applies only while the worker still owns the claim and the retry count is
/// the one it observed. A false return means another worker took the record
/// over, so it must not be dispatched.
pub fn renew_outbox_claim(conn: &Connection, renewal: &ClaimRenewal) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_records
         SET claimed_until = ?1
         WHERE id = ?2 AND processed_at IS NULL AND claimed_by = ?3 AND retry_count = ?4",
        params![
            to_millis(renewal.claimed_until),
            renewal.record_id,
            renewal.worker_id,
            renewal.expected_retry_count,
        ],
    )?;
    Ok(count > 0)
}

/// Mark a claimed record processed and drop its claim.
///
/// Returns false if `worker_id` no longer owns the claim, or the record was
/// already processed or no longer exists. `processed_at` is never overwritten.
pub fn mark_outbox_record_processed(
    conn: &Connection,
    id: &str,
    worker_id: &str,
    processed_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_records
         SET processed_at = ?2, claimed_by = NULL, claimed_until = NULL
         WHERE id = ?1 AND processed_at IS NULL AND claimed_by = ?3",
        params![id, to_millis(processed_at), worker_id],
    )?;
    Ok(count > 0)
}

/// Record a failed attempt and schedule the next one.
///
/// Applies only while the worker still owns the claim and the retry count is
/// the one it observed; returns false otherwise.
pub fn schedule_outbox_retry(conn: &Connection, retry: &RetrySchedule) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_records
         SET retry_count = ?1, last_error = ?2, next_retry_at = ?3,
             claimed_by = NULL, claimed_until = NULL
         WHERE id = ?4 AND processed_at IS NULL AND claimed_by = ?5 AND retry_count = ?6",
        params![
            retry.retry_count,
            retry.last_error,
            to_millis(retry.next_retry_at),
            retry.record_id,
            retry.worker_id,
            retry.expected_retry_count,
        ],
    )?;
    Ok(count > 0)
}

/// Release claims on records the worker took but never attempted.
pub fn release_outbox_claims(
    conn: &Connection,
    worker_id: &str,
    record_ids: &[String],
) -> DatabaseResult<usize> {
    if record_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = std::iter::repeat("?")
        .take(record_ids.len())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE outbox_records
         SET claimed_by = NULL, claimed_until = NULL
         WHERE claimed_by = ? AND processed_at IS NULL AND id IN ({})",
        placeholders
    );

    let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(record_ids.len() + 1);
    params_vec.push(&worker_id);
    for id in record_ids {
        params_vec.push(id);
    }

    Ok(conn.execute(&sql, params_vec.as_slice())?)
}

/// Delete processed records older than `before`.
pub fn purge_processed_outbox_records(
    conn: &Connection,
    before: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM outbox_records WHERE processed_at IS NOT NULL AND processed_at < ?1",
        params![to_millis(before)],
    )?;
    Ok(count)
}

/// Counts across the outbox and dead-letter tables.
pub fn get_outbox_stats(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<OutboxStats> {
    let (pending, retrying, processed, claimed): (i64, i64, i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND retry_count = 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND retry_count > 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NOT NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND claimed_until > ?1 THEN 1 ELSE 0 END), 0)
         FROM outbox_records",
        params![to_millis(now)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    let dead_lettered: i64 =
        conn.query_row("SELECT COUNT(*) FROM dead_letter_records", [], |row| row.get(0))?;

    Ok(OutboxStats {
        pending: pending as u64,
        retrying: retrying as u64,
        processed: processed as u64,
        claimed: claimed as u64,
        dead_lettered: dead_lettered as u64,
    })
}

// ==========================================
// Dead letters
// ==========================================

/// Move a claimed record into the dead-letter table.
///
/// The outbox row is deleted and the dead letter inserted in the same
/// transaction. Returns `None` (and changes nothing) when the worker no
/// longer owns the claim or the record changed since it was claimed.
pub fn promote_to_dead_letter(
    tx: &Transaction<'_>,
    promotion: &DeadLetterPromotion,
) -> DatabaseResult<Option<DeadLetterRecord>> {
    let record = {
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_records
             WHERE id = ?1 AND processed_at IS NULL AND claimed_by = ?2 AND retry_count = ?3"
        ))?;
        match stmt.query_row(
            params![
                promotion.record_id,
                promotion.worker_id,
                promotion.expected_retry_count
            ],
            map_outbox_record,
        ) {
            Ok(record) => record,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    };

    let dead_letter = DeadLetterRecord {
        id: promotion.dead_letter_id.clone(),
        original_record_id: record.id.clone(),
        event_type: record.event_type,
        payload: record.payload,
        idempotency_key: record.idempotency_key,
        original_created_at: record.created_at,
        moved_to_dead_letter_at: promotion.moved_at,
        total_retry_attempts: promotion.total_retry_attempts,
        last_error: promotion.last_error.clone(),
    };

    insert_dead_letter(tx, &dead_letter)?;
    tx.execute("DELETE FROM outbox_records WHERE id = ?1", params![record.id])?;

    Ok(Some(dead_letter))
}

fn insert_dead_letter(conn: &Connection, record: &DeadLetterRecord) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO dead_letter_records (id, original_record_id, event_type, payload,
             idempotency_key, original_created_at, moved_to_dead_letter_at,
             total_retry_attempts, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.original_record_id,
            record.event_type,
            record.payload,
            record.idempotency_key,
            to_millis(record.original_created_at),
            to_millis(record.moved_to_dead_letter_at),
            record.total_retry_attempts,
            record.last_error,
        ],
    )?;
    Ok(())
}

/// Get a dead letter by ID.
pub fn get_dead_letter(conn: &Connection, id: &str) -> DatabaseResult<Option<DeadLetterRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_records WHERE id = ?1"
    ))?;

    match stmt.query_row(params![id], map_dead_letter) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List dead letters, most recently moved first.
pub fn list_dead_letters(
    conn: &Connection,
    filter: &DeadLetterFilter,
    page: Pagination,
) -> DatabaseResult<DeadLetterPage> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(event_type) = &filter.event_type {
        values.push(Box::new(event_type.clone()));
        clauses.push(format!("event_type = ?{}", values.len()));
    }
    if let Some(after) = filter.moved_after {
        values.push(Box::new(to_millis(after)));
        clauses.push(format!("moved_to_dead_letter_at >= ?{}", values.len()));
    }
    if let Some(before) = filter.moved_before {
        values.push(Box::new(to_millis(before)));
        clauses.push(format!("moved_to_dead_letter_at < ?{}", values.len()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM dead_letter_records {where_sql}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let limit_idx = values.len() + 1;
    let offset_idx = values.len() + 2;
    values.push(Box::new(page.limit as i64));
    values.push(Box::new(page.offset as i64));

    let mut stmt = conn.prepare(&format!(
        "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_records {where_sql}
         ORDER BY moved_to_dead_letter_at DESC, id ASC
         LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    ))?;
    let records = stmt
        .query_map(params_from_iter(values.iter()), map_dead_letter)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DeadLetterPage {
        records,
        total: total as u64,
    })
}

/// Permanently delete a dead letter.
pub fn delete_dead_letter(conn: &Connection, id: &str) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM dead_letter_records WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

/// Re-enqueue a dead letter as a fresh outbox record and delete it.
///
/// The new record keeps the event type, payload and idempotency key, starts
/// at `retry_count = 0` and is eligible immediately. Returns `None` if the
/// dead letter does not exist.
pub fn replay_dead_letter(
    tx: &Transaction<'_>,
    dead_letter_id: &str,
    new_record_id: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<OutboxRecord>> {
    let Some(dead_letter) = get_dead_letter(tx, dead_letter_id)? else {
        return Ok(None);
    };

    insert_outbox_record(
        tx,
        &NewOutboxRecord {
            id: new_record_id.to_string(),
            event_type: dead_letter.event_type,
            payload: dead_letter.payload,
            idempotency_key: dead_letter.idempotency_key,
            created_at: now,
        },
    )?;
    tx.execute(
        "DELETE FROM dead_letter_records WHERE id = ?1",
        params![dead_letter_id],
    )?;

    get_outbox_record(tx, new_record_id)
}

// ==========================================
// Row mapping
// ==========================================

fn map_outbox_record(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    Ok(OutboxRecord {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: row.get(2)?,
        idempotency_key: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        processed_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        next_retry_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        claimed_by: row.get(9)?,
        claimed_until: row.get::<_, Option<i64>>(10)?.map(from_millis),
    })
}

fn map_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    Ok(DeadLetterRecord {
        id: row.get(0)?,
        original_record_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        idempotency_key: row.get(4)?,
        original_created_at: from_millis(row.get(5)?),
        moved_to_dead_letter_at: from_millis(row.get(6)?),
        total_retry_attempts: row.get(7)?,
        last_error: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn insert(conn: &mut Connection, id: &str, key: Option<&str>, created_at: DateTime<Utc>) {
        let tx = conn.transaction().unwrap();
        insert_outbox_record(
            &tx,
            &NewOutboxRecord {
                id: id.to_string(),
                event_type: "task.created".to_string(),
                payload: format!(r#"{{"task_id":"{id}"}}"#).into_bytes(),
                idempotency_key: key.map(str::to_string),
                created_at,
            },
        )
        .unwrap();
        tx.commit().unwrap();
    }

    fn claim(conn: &mut Connection, worker: &str, now: DateTime<Utc>, limit: usize) -> Vec<String> {
        let tx = conn.transaction().unwrap();
        let records = claim_due_outbox_records(
            &tx,
            &OutboxClaim {
                worker_id: worker.to_string(),
                now,
                claimed_until: now + Duration::minutes(5),
                limit,
            },
        )
        .unwrap();
        tx.commit().unwrap();
        records.into_iter().map(|r| r.id).collect()
    }

    fn fail(conn: &Connection, id: &str, worker: &str, from: u32, next: DateTime<Utc>) -> bool {
        schedule_outbox_retry(
            conn,
            &RetrySchedule {
                record_id: id.to_string(),
                worker_id: worker.to_string(),
                expected_retry_count: from,
                retry_count: from + 1,
                last_error: "handler_failed: boom".to_string(),
                next_retry_at: next,
            },
        )
        .unwrap()
    }

    fn promote(conn: &mut Connection, id: &str, worker: &str, from: u32) -> Option<DeadLetterRecord> {
        let tx = conn.transaction().unwrap();
        let result = promote_to_dead_letter(
            &tx,
            &DeadLetterPromotion {
                dead_letter_id: format!("dl-{id}"),
                record_id: id.to_string(),
                worker_id: worker.to_string(),
                expected_retry_count: from,
                total_retry_attempts: from + 1,
                last_error: "handler_failed: boom".to_string(),
                moved_at: t0(),
            },
        )
        .unwrap();
        tx.commit().unwrap();
        result
    }

    #[test]
    fn test_insert_and_get_outbox_record() {
        let mut conn = setup();
        insert(&mut conn, "a", Some("k1"), t0());

        let record = get_outbox_record(&conn, "a").unwrap().unwrap();
        assert_eq!(record.event_type, "task.created");
        assert_eq!(record.payload, br#"{"task_id":"a"}"#.to_vec());
        assert_eq!(record.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(record.created_at, t0());
        assert_eq!(record.retry_count, 0);
        assert!(record.processed_at.is_none());
        assert!(record.next_retry_at.is_none());

        assert!(get_outbox_record(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_rolled_back_with_business_transaction() {
        let mut conn = setup();
        {
            let tx = conn.transaction().unwrap();
            insert_outbox_record(
                &tx,
                &NewOutboxRecord {
                    id: "a".to_string(),
                    event_type: "task.created".to_string(),
                    payload: b"{}".to_vec(),
                    idempotency_key: None,
                    created_at: t0(),
                },
            )
            .unwrap();
            // dropped without commit
        }
        assert!(get_outbox_record(&conn, "a").unwrap().is_none());
    }

    #[test]
    fn test_claim_in_creation_order_with_limit() {
        let mut conn = setup();
        insert(&mut conn, "c", None, t0() + Duration::seconds(2));
        insert(&mut conn, "a", None, t0());
        insert(&mut conn, "b", None, t0() + Duration::seconds(1));

        let claimed = claim(&mut conn, "w1", t0() + Duration::minutes(1), 2);
        assert_eq!(claimed, vec!["a", "b"]);

        let record = get_outbox_record(&conn, "a").unwrap().unwrap();
        assert_eq!(record.claimed_by.as_deref(), Some("w1"));
    }

    #[test]
    fn test_claim_skips_future_retry_and_processed() {
        let mut conn = setup();
        let now = t0() + Duration::minutes(1);
        insert(&mut conn, "due", None, t0());
        insert(&mut conn, "later", None, t0());
        insert(&mut conn, "done", None, t0());

        assert_eq!(claim(&mut conn, "w1", now, 10).len(), 3);
        assert!(fail(&conn, "later", "w1", 0, now + Duration::minutes(2)));
        assert!(fail(&conn, "due", "w1", 0, now));
        assert!(mark_outbox_record_processed(&conn, "done", "w1", now).unwrap());

        let claimed = claim(&mut conn, "w1", now, 10);
        assert_eq!(claimed, vec!["due"]);

        let claimed = claim(&mut conn, "w1", now + Duration::minutes(2), 10);
        assert_eq!(claimed, vec!["later"]);
    }

    #[test]
    fn test_claim_is_exclusive_until_lease_expires() {
        let mut conn = setup();
        insert(&mut conn, "a", None, t0());

        assert_eq!(claim(&mut conn, "w1", t0(), 10), vec!["a"]);
        assert!(claim(&mut conn, "w2", t0() + Duration::minutes(4), 10).is_empty());
        assert_eq!(
            claim(&mut conn, "w2", t0() + Duration::minutes(5), 10),
            vec!["a"]
        );
    }

    #[test]
    fn test_claim_skips_key_held_by_another_claim() {
        let mut conn = setup();
        insert(&mut conn, "first", Some("k1"), t0());
        assert_eq!(claim(&mut conn, "w1", t0(), 10), vec!["first"]);

        insert(&mut conn, "second", Some("k1"), t0() + Duration::seconds(1));
        insert(&mut conn, "other", Some("k2"), t0() + Duration::seconds(1));

        let claimed = claim(&mut conn, "w2", t0() + Duration::seconds(2), 10);
        assert_eq!(claimed, vec!["other"]);
    }

    #[test]
    fn test_idempotency_key_processed() {
        let mut conn = setup();
        insert(&mut conn, "a", Some("k1"), t0());
        assert!(!is_idempotency_key_processed(&conn, "k1").unwrap());

        claim(&mut conn, "w1", t0(), 10);
        mark_outbox_record_processed(&conn, "a", "w1", t0()).unwrap();
        assert!(is_idempotency_key_processed(&conn, "k1").unwrap());
        assert!(!is_idempotency_key_processed(&conn, "k2").unwrap());
    }

    #[test]
    fn test_processed_at_written_once() {
        let mut conn = setup();
        insert(&mut conn, "a", None, t0());
        claim(&mut conn, "w1", t0(), 10);

        assert!(mark_outbox_record_processed(&conn, "a", "w1", t0()).unwrap());
        assert!(!mark_outbox_record_processed(&conn, "a", "w1", t0() + Duration::hours(1)).unwrap());

        let record = get_outbox_record(&conn, "a").unwrap().unwrap();
        assert_eq!(record.processed_at, Some(t0()));
        assert!(record.claimed_by.is_none());
    }

    #[test]
    fn test_processed_requires_claim_ownership() {
        let mut conn = setup();
        insert(&mut conn, "a", None, t0());

        assert!(!mark_outbox_record_processed(&conn, "a", "w1", t0()).unwrap());

        claim(&mut conn, "w1", t0(), 10);
        claim(&mut conn, "w2", t0() + Duration::minutes(5), 10);
        assert!(!mark_outbox_record_processed(&conn, "a", "w1", t0()).unwrap());
        assert!(mark_outbox_record_processed(&conn, "a", "w2", t0()).unwrap());
    }

    #[test]
    fn test_renew_claim_extends_lease_for_owner_only() {
        let mut conn = setup();
        insert(&mut conn, "a", None, t0());
        claim(&mut conn, "w1", t0(), 10);

        let renewal = |worker: &str, from: u32| ClaimRenewal {
            record_id: "a".to_string(),
            worker_id: worker.to_string(),
            expected_retry_count: from,
            claimed_until: t0() + Duration::minutes(20),
        };
        assert!(!renew_outbox_claim(&conn, &renewal("w2", 0)).unwrap());
        assert!(!renew_outbox_claim(&conn, &renewal("w1", 1)).unwrap());
        assert!(renew_outbox_claim(&conn, &renewal("w1", 0)).unwrap());

        let record = get_outbox_record(&conn, "a").unwrap().unwrap();
        assert_eq!(record.claimed_until, Some(t0() + Duration::minutes(20)));
        assert!(claim(&mut conn, "w2", t0() + Duration::minutes(10), 10).is_empty());
    }

    #[test]
    fn test_retry_requires_claim_ownership() {
        let mut conn = setup();
        insert(&mut conn, "a", None, t0());
        claim(&mut conn, "w1", t0(), 10);

        assert!(!fail(&conn, "a", "w2", 0, t0() + Duration::minutes(2)));
        assert!(!fail(&conn, "a", "w1", 1, t0() + Duration::minutes(2)));
        assert!(fail(&conn, "a", "w1", 0, t0() + Duration::minutes(2)));

        let record = get_outbox_record(&conn, "a").unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("handler_failed: boom"));
        assert_eq!(record.next_retry_at, Some(t0() + Duration::minutes(2)));
        assert!(record.claimed_by.is_none());
    }

    #[test]
    fn test_release_claims() {
        let mut conn = setup();
        insert(&mut conn, "a", None, t0());
        insert(&mut conn, "b", None, t0());
        claim(&mut conn, "w1", t0(), 10);

        let released =
            release_outbox_claims(&conn, "w1", &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(released, 2);
        assert_eq!(claim(&mut conn, "w2", t0(), 10).len(), 2);
        assert_eq!(release_outbox_claims(&conn, "w1", &[]).unwrap(), 0);
    }

    #[test]
    fn test_promote_moves_record_atomically() {
        let mut conn = setup();
        insert(&mut conn, "a", Some("k1"), t0());
        claim(&mut conn, "w1", t0(), 10);

        assert!(promote(&mut conn, "a", "w2", 0).is_none());
        assert!(get_outbox_record(&conn, "a").unwrap().is_some());

        let dead = promote(&mut conn, "a", "w1", 0).unwrap();
        assert_eq!(dead.original_record_id, "a");
        assert_eq!(dead.total_retry_attempts, 1);
        assert_eq!(dead.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(dead.original_created_at, t0());

        assert!(get_outbox_record(&conn, "a").unwrap().is_none());
        assert_eq!(get_dead_letter(&conn, "dl-a").unwrap().unwrap(), dead);
    }

    #[test]
    fn test_replay_dead_letter() {
        let mut conn = setup();
        insert(&mut conn, "a", Some("k1"), t0());
        claim(&mut conn, "w1", t0(), 10);
        promote(&mut conn, "a", "w1", 0).unwrap();

        let later = t0() + Duration::hours(1);
        let tx = conn.transaction().unwrap();
        let replayed = replay_dead_letter(&tx, "dl-a", "a2", later).unwrap().unwrap();
        assert!(replay_dead_letter(&tx, "missing", "a3", later).unwrap().is_none());
        tx.commit().unwrap();

        assert_eq!(replayed.id, "a2");
        assert_eq!(replayed.retry_count, 0);
        assert!(replayed.next_retry_at.is_none());
        assert_eq!(replayed.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(replayed.payload, br#"{"task_id":"a"}"#.to_vec());
        assert!(get_dead_letter(&conn, "dl-a").unwrap().is_none());
        assert_eq!(claim(&mut conn, "w1", later, 10), vec!["a2"]);
    }

    #[test]
    fn test_list_dead_letters_filters_and_pages() {
        let conn = setup();
        for (i, event_type) in ["task.created", "sprint.started", "task.created"]
            .iter()
            .enumerate()
        {
            insert_dead_letter(
                &conn,
                &DeadLetterRecord {
                    id: format!("dl-{i}"),
                    original_record_id: format!("r-{i}"),
                    event_type: event_type.to_string(),
                    payload: b"{}".to_vec(),
                    idempotency_key: None,
                    original_created_at: t0(),
                    moved_to_dead_letter_at: t0() + Duration::hours(i as i64),
                    total_retry_attempts: 3,
                    last_error: "handler_failed: boom".to_string(),
                },
            )
            .unwrap();
        }

        let all = list_dead_letters(&conn, &DeadLetterFilter::default(), Pagination::default())
            .unwrap();
        assert_eq!(all.total, 3);
        let ids: Vec<_> = all.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["dl-2", "dl-1", "dl-0"]);

        let tasks = list_dead_letters(
            &conn,
            &DeadLetterFilter {
                event_type: Some("task.created".to_string()),
                ..Default::default()
            },
            Pagination { limit: 1, offset: 1 },
        )
        .unwrap();
        assert_eq!(tasks.total, 2);
        assert_eq!(tasks.records.len(), 1);
        assert_eq!(tasks.records[0].id, "dl-0");

        let window = list_dead_letters(
            &conn,
            &DeadLetterFilter {
                event_type: None,
                moved_after: Some(t0() + Duration::hours(1)),
                moved_before: Some(t0() + Duration::hours(2)),
            },
            Pagination::default(),
        )
        .unwrap();
        assert_eq!(window.total, 1);
        assert_eq!(window.records[0].id, "dl-1");

        assert!(delete_dead_letter(&conn, "dl-1").unwrap());
        assert!(!delete_dead_letter(&conn, "dl-1").unwrap());
    }

    #[test]
    fn test_stats_and_purge() {
        let mut conn = setup();
        insert(&mut conn, "pending", None, t0());
        insert(&mut conn, "retrying", None, t0());
        insert(&mut conn, "old", None, t0());
        insert(&mut conn, "recent", None, t0());
        insert(&mut conn, "dead", None, t0());

        claim(&mut conn, "w1", t0(), 10);
        fail(&conn, "retrying", "w1", 0, t0() + Duration::minutes(2));
        mark_outbox_record_processed(&conn, "old", "w1", t0()).unwrap();
        mark_outbox_record_processed(&conn, "recent", "w1", t0() + Duration::days(10)).unwrap();
        promote(&mut conn, "dead", "w1", 0).unwrap();

        let stats = get_outbox_stats(&conn, t0() + Duration::minutes(1)).unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 1,
                retrying: 1,
                processed: 2,
                claimed: 1,
                dead_lettered: 1,
            }
        );

        let purged = purge_processed_outbox_records(&conn, t0() + Duration::days(1)).unwrap();
        assert_eq!(purged, 1);
        assert!(get_outbox_record(&conn, "old").unwrap().is_none());
        assert!(get_outbox_record(&conn, "recent").unwrap().is_some());
    }
}
