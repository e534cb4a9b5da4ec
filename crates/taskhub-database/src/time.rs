//! Timestamp conversion helpers.
//!
//! Timestamps are stored as INTEGER unix milliseconds so due-ness and
//! ordering comparisons happen in SQL.

use chrono::{DateTime, Utc};

/// Convert a timestamp to unix milliseconds.
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert unix milliseconds back to a timestamp, falling back to now for
/// out-of-range values.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
