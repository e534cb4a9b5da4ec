//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbox record - one event awaiting (or past) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub event_type: String,
    /// Encoded event body; opaque to the store.
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once, when dispatch succeeds (or a duplicate is suppressed).
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// `None` means eligible immediately.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn status(&self) -> OutboxRecordStatus {
        if self.processed_at.is_some() {
            OutboxRecordStatus::Processed
        } else if self.retry_count > 0 {
            OutboxRecordStatus::Retrying
        } else {
            OutboxRecordStatus::Pending
        }
    }

    /// Whether a poll at `now` may select this record, ignoring claims.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.processed_at.is_none() && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Derived lifecycle state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxRecordStatus {
    Pending,
    Retrying,
    Processed,
}

impl OutboxRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Processed => "processed",
        }
    }
}

/// New outbox record for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Claim request for one poll cycle.
#[derive(Debug, Clone)]
pub struct OutboxClaim {
    pub worker_id: String,
    pub now: DateTime<Utc>,
    /// Lease expiry written into `claimed_until`.
    pub claimed_until: DateTime<Utc>,
    pub limit: usize,
}

/// Lease extension taken just before a claimed record is dispatched.
#[derive(Debug, Clone)]
pub struct ClaimRenewal {
    pub record_id: String,
    pub worker_id: String,
    /// `retry_count` the worker observed when it claimed the record.
    pub expected_retry_count: u32,
    pub claimed_until: DateTime<Utc>,
}

/// Failure bookkeeping for a claimed record that will be retried.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub record_id: String,
    pub worker_id: String,
    /// `retry_count` the worker observed when it claimed the record.
    pub expected_retry_count: u32,
    pub retry_count: u32,
    pub last_error: String,
    pub next_retry_at: DateTime<Utc>,
}

/// Move of a claimed record into the dead-letter table.
#[derive(Debug, Clone)]
pub struct DeadLetterPromotion {
    pub dead_letter_id: String,
    pub record_id: String,
    pub worker_id: String,
    pub expected_retry_count: u32,
    pub total_retry_attempts: u32,
    pub last_error: String,
    pub moved_at: DateTime<Utc>,
}

/// Dead-letter record - terminal state for undeliverable events.
///
/// Never updated in place: it is either deleted or replayed (which also
/// deletes it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub original_record_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub original_created_at: DateTime<Utc>,
    pub moved_to_dead_letter_at: DateTime<Utc>,
    pub total_retry_attempts: u32,
    pub last_error: String,
}

/// Filters for listing dead letters. All fields are optional and combined
/// with AND.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub event_type: Option<String>,
    /// Inclusive lower bound on `moved_to_dead_letter_at`.
    pub moved_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `moved_to_dead_letter_at`.
    pub moved_before: Option<DateTime<Utc>>,
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of dead letters plus the total matching the filter.
#[derive(Debug, Clone)]
pub struct DeadLetterPage {
    pub records: Vec<DeadLetterRecord>,
    pub total: u64,
}

/// Counts across both tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    /// Unprocessed, never failed.
    pub pending: u64,
    /// Unprocessed, failed at least once.
    pub retrying: u64,
    pub processed: u64,
    /// Unprocessed and currently under an unexpired claim.
    pub claimed: u64,
    pub dead_lettered: u64,
}
