//! Transactional outbox for Taskhub domain events.
//!
//! Business code records an event in the same SQLite transaction as the state
//! change that caused it. A background worker later delivers each committed
//! event to its registered handlers at least once, retrying failures with
//! exponential backoff and parking events that keep failing in a dead-letter
//! table for operators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   enqueue(tx, ..)    ┌──────────────────────┐
//! │ business transaction │ ───────────────────▶ │    outbox_records    │
//! └──────────────────────┘                      └──────────┬───────────┘
//!                                                          │ claim (lease)
//!                                                          ▼
//! ┌──────────────────────┐    dispatch          ┌──────────────────────┐
//! │  DispatchRegistry    │ ◀─────────────────── │     OutboxWorker     │
//! │  tag -> [handlers]   │ ── ok / error ─────▶ │  poll every 5s       │
//! └──────────────────────┘                      └──────────┬───────────┘
//!                                                          │ retries exhausted
//!                                                          ▼
//!                         retry / delete        ┌──────────────────────┐
//!        DeadLetterAdmin ─────────────────────▶ │  dead_letter_records │
//!                                               └──────────────────────┘
//! ```
//!
//! # Delivery rules
//!
//! - Records are claimed in creation order, at most `batch_size` per cycle,
//!   and only once `next_retry_at` has passed.
//! - A record whose idempotency key was already processed is marked
//!   processed without running any handler.
//! - Records sharing a key are dispatched one after another; unrelated
//!   records run concurrently up to `max_concurrency`.
//! - The `n`th failure schedules the next attempt `backoff_base * 2^n` later
//!   (2 min, then 4 min by default). The failure that reaches `max_retries`
//!   moves the record to the dead-letter table.
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(&path).await?;
//!
//! let mut builder = DispatchRegistry::builder();
//! builder.register(event_types::TASK_ASSIGNED, NotifyAssignee::new(mailer))?;
//! let registry = Arc::new(builder.build()?);
//!
//! let handle = OutboxWorker::new(db.clone(), registry, WorkerConfig::default())?.start();
//!
//! db.transaction(move |tx| {
//!     assign_task(tx, &task_id, &user_id)?;
//!     enqueue_event(tx, &TaskAssigned { task_id, user_id }, None)
//! })
//! .await?;
//!
//! handle.shutdown().await;
//! ```

mod backoff;
mod dead_letter;
mod enqueue;
mod error;
mod events;
mod maintenance;
mod registry;
mod worker;

#[cfg(test)]
mod tests;

pub use backoff::{record_failure, BackoffPolicy, FailureOutcome};
pub use dead_letter::DeadLetterAdmin;
pub use enqueue::{enqueue, enqueue_event};
pub use error::{OutboxError, OutboxResult};
pub use events::{event_types, DomainEvent};
pub use maintenance::{outbox_stats, purge_processed};
pub use registry::{
    DispatchError, DispatchRegistry, DispatchRegistryBuilder, EventEnvelope, EventHandler,
    RegistryError, TypedEventHandler, TypedHandler,
};
pub use worker::{CycleReport, OutboxWorker, ShutdownTrigger, WorkerConfig, WorkerHandle};

pub use taskhub_database::{
    AsyncDatabase, DeadLetterFilter, DeadLetterPage, DeadLetterRecord, OutboxRecord,
    OutboxRecordStatus, OutboxStats, Pagination,
};
