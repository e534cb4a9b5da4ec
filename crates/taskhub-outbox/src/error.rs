//! Error types for the outbox pipeline.

use crate::registry::RegistryError;
use taskhub_database::DatabaseError;
use thiserror::Error;

/// Errors raised by the worker, the dead-letter admin and maintenance
/// operations. Handler failures never surface here; they are recorded on the
/// outbox record instead.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Store unavailable or a statement failed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handler registration error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
