//! Retry scheduling after a failed dispatch.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exponential backoff: the record's `n`th failure waits `base * 2^n`,
/// capped at `max`.
///
/// With the default one-minute base:
///
/// | Failure | Delay |
/// |---------|-------|
/// | 1       | 2 min |
/// | 2       | 4 min |
/// | 3       | 8 min |
/// | 6+      | 60 min (capped) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt once a record has failed `retry_count` times.
    pub fn delay(&self, retry_count: u32) -> chrono::Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64)
    }
}

/// What happens to a record after a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Keep the record and try again at `next_retry_at`.
    Retry {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retries are exhausted; move the record to the dead-letter table.
    DeadLetter { total_retry_attempts: u32 },
}

/// Decide the fate of a record that has just failed at `failed_at`.
///
/// `previous_retry_count` is the count stored before this failure; the
/// failure itself increments it.
pub fn record_failure(
    previous_retry_count: u32,
    failed_at: DateTime<Utc>,
    max_retries: u32,
    policy: &BackoffPolicy,
) -> FailureOutcome {
    let retry_count = previous_retry_count.saturating_add(1);
    if retry_count >= max_retries {
        return FailureOutcome::DeadLetter {
            total_retry_attempts: retry_count,
        };
    }

    FailureOutcome::Retry {
        retry_count,
        next_retry_at: failed_at + policy.delay(retry_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn delay_doubles_per_failure_and_caps() {
        let policy = BackoffPolicy {
            base: minutes(1),
            max: minutes(10),
        };

        assert_eq!(policy.delay(1), chrono::Duration::minutes(2));
        assert_eq!(policy.delay(2), chrono::Duration::minutes(4));
        assert_eq!(policy.delay(3), chrono::Duration::minutes(8));
        assert_eq!(policy.delay(4), chrono::Duration::minutes(10));
        assert_eq!(policy.delay(500), chrono::Duration::minutes(10));
    }

    #[test]
    fn delay_is_never_zero() {
        let policy = BackoffPolicy::default();
        assert!(policy.delay(0) > chrono::Duration::zero());
    }

    #[test]
    fn first_and_second_failures_schedule_retries() {
        let policy = BackoffPolicy::default();
        let failed_at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

        assert_eq!(
            record_failure(0, failed_at, 3, &policy),
            FailureOutcome::Retry {
                retry_count: 1,
                next_retry_at: failed_at + chrono::Duration::minutes(2),
            }
        );
        assert_eq!(
            record_failure(1, failed_at, 3, &policy),
            FailureOutcome::Retry {
                retry_count: 2,
                next_retry_at: failed_at + chrono::Duration::minutes(4),
            }
        );
    }

    #[test]
    fn third_failure_dead_letters() {
        let policy = BackoffPolicy::default();
        let failed_at = Utc::now();

        assert_eq!(
            record_failure(2, failed_at, 3, &policy),
            FailureOutcome::DeadLetter {
                total_retry_attempts: 3
            }
        );
    }

    #[test]
    fn single_attempt_budget_dead_letters_immediately() {
        let outcome = record_failure(0, Utc::now(), 1, &BackoffPolicy::default());
        assert_eq!(
            outcome,
            FailureOutcome::DeadLetter {
                total_retry_attempts: 1
            }
        );
    }

    #[test]
    fn next_retry_is_strictly_after_failure() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
        };
        let failed_at = Utc::now();
        match record_failure(0, failed_at, 3, &policy) {
            FailureOutcome::Retry { next_retry_at, .. } => assert!(next_retry_at > failed_at),
            other => panic!("expected retry, got {other:?}"),
        }
    }
}
