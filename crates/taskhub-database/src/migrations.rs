//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.
//! The version check and every pending migration run in one IMMEDIATE
//! transaction, so processes opening a fresh file together apply each
//! migration once.

use crate::DatabaseResult;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    apply_pending(&tx)?;
    tx.commit()?;

    info!("Migrations complete");
    Ok(())
}

fn apply_pending(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_records(conn)?;
    }
    if current_version < 2 {
        migrate_v2_dead_letter_records(conn)?;
    }
    if current_version < 3 {
        migrate_v3_outbox_claims(conn)?;
    }
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Outbox table written by business transactions.
fn migrate_v1_outbox_records(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox records");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_records (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            idempotency_key TEXT,
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            last_error TEXT,
            next_retry_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_records_due
            ON outbox_records(processed_at, next_retry_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_records_idempotency_key
            ON outbox_records(idempotency_key, processed_at)
            WHERE idempotency_key IS NOT NULL;
        ",
    )?;

    record_migration(conn, 1, "outbox_records")?;
    Ok(())
}

/// V2: Terminal storage for records that exhausted their retries.
fn migrate_v2_dead_letter_records(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: dead letter records");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dead_letter_records (
            id TEXT PRIMARY KEY,
            original_record_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            idempotency_key TEXT,
            original_created_at INTEGER NOT NULL,
            moved_to_dead_letter_at INTEGER NOT NULL,
            total_retry_attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letter_records_event_type
            ON dead_letter_records(event_type, moved_to_dead_letter_at);
        CREATE INDEX IF NOT EXISTS idx_dead_letter_records_moved_at
            ON dead_letter_records(moved_to_dead_letter_at);
        ",
    )?;

    record_migration(conn, 2, "dead_letter_records")?;
    Ok(())
}

/// V3: Claim lease columns so several worker processes can share one store.
fn migrate_v3_outbox_claims(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v3: outbox claims");

    conn.execute_batch(
        "
        ALTER TABLE outbox_records ADD COLUMN claimed_by TEXT;
        ALTER TABLE outbox_records ADD COLUMN claimed_until INTEGER;

        CREATE INDEX IF NOT EXISTS idx_outbox_records_claimed_by
            ON outbox_records(claimed_by)
            WHERE claimed_by IS NOT NULL;
        ",
    )?;

    record_migration(conn, 3, "outbox_claims")?;
    Ok(())
}
