//! Pipeline tests for the outbox worker, registry and dead-letter admin.
//!
//! - `harness.rs`       - Database harness and scripted handlers
//! - `delivery.rs`      - At-least-once delivery, batch bounds, handler chains
//! - `idempotency.rs`   - Duplicate suppression and per-key sequencing
//! - `retry_backoff.rs` - Failure bookkeeping, backoff and eligibility
//! - `timeout.rs`       - Handler timeouts
//! - `dead_letter.rs`   - Listing, replaying and deleting dead letters
//! - `claims.rs`        - Multi-worker claims and lease expiry
//! - `shutdown.rs`      - Graceful stop and background loop
//! - `store_failure.rs` - Store errors mid-cycle and loop recovery
//! - `scenario.rs`      - End-to-end: fail three times, replay, deliver

mod retry_backoff;
mod shutdown;
