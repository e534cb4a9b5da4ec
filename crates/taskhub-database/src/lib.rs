//! SQLite storage for the Taskhub event outbox.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Schema migrations for the outbox and dead-letter tables
//! - Model types for both tables
//! - Query functions for every state transition the worker performs
//!
//! # Transactions
//!
//! Statements that must be atomic with each other take a
//! `&rusqlite::Transaction` rather than a `&Connection`. Business code that
//! enqueues events passes its own open transaction; the worker uses
//! [`AsyncDatabase::transaction`].
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let claimed = db
//!     .transaction(move |tx| queries::claim_due_outbox_records(tx, &claim))
//!     .await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `db.call()` and
//! `db.transaction()`. Handler invocation happens outside.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;
mod time;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
pub use time::{from_millis, to_millis};
