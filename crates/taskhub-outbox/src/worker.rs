//! Polling outbox worker.
//!
//! Each cycle claims a batch of due records, dispatches them and writes one
//! state transition per record. Records sharing an idempotency key run
//! sequentially in creation order; distinct keys run concurrently up to
//! `max_concurrency`.

use crate::backoff::{record_failure, BackoffPolicy, FailureOutcome};
use crate::maintenance;
use crate::registry::{DispatchRegistry, EventEnvelope};
use crate::{OutboxError, OutboxResult};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskhub_database::{
    queries, AsyncDatabase, ClaimRenewal, DeadLetterPromotion, OutboxClaim, OutboxRecord,
    RetrySchedule,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker tuning.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `poll_interval` | 5s |
/// | `batch_size` | 50 |
/// | `max_retries` | 3 |
/// | `backoff` | 1 min base, 1 h cap |
/// | `handler_timeout` | 30s |
/// | `claim_ttl` | 5 min |
/// | `max_concurrency` | 4 |
/// | `processed_retention` | 7 days, purged every 720 cycles |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Failures allowed before a record is dead-lettered.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Budget for each handler invocation.
    pub handler_timeout: Duration,
    /// Lease written on claimed records and renewed before each attempt,
    /// plus one `handler_timeout` per extra handler in the chain. Must exceed
    /// `handler_timeout`.
    pub claim_ttl: Duration,
    /// Idempotency-key groups dispatched in parallel.
    pub max_concurrency: usize,
    /// Identity stamped into `claimed_by`. Unique per process.
    pub worker_id: String,
    /// `None` keeps processed records forever.
    pub processed_retention: Option<chrono::Duration>,
    /// Purge runs every N cycles; zero disables it.
    pub purge_every_cycles: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            handler_timeout: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(300),
            max_concurrency: 4,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            processed_retention: Some(chrono::Duration::days(7)),
            purge_every_cycles: 720,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> OutboxResult<()> {
        let invalid = |msg: &str| Err(OutboxError::InvalidConfig(msg.to_string()));

        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be greater than zero");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero");
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be greater than zero");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be greater than zero");
        }
        if self.backoff.base.is_zero() || self.backoff.max < self.backoff.base {
            return invalid("backoff base must be non-zero and not exceed the cap");
        }
        if self.claim_ttl <= self.handler_timeout {
            return invalid("claim_ttl must exceed handler_timeout");
        }
        if self.worker_id.trim().is_empty() {
            return invalid("worker_id must not be empty");
        }
        Ok(())
    }
}

/// Per-cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    /// Dispatched successfully.
    pub processed: usize,
    /// Marked processed without dispatch because the key was already handled.
    pub duplicates: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Claimed but not attempted because shutdown was requested.
    pub abandoned: usize,
    /// The claim moved to another worker before the record was attempted or
    /// before its result was written.
    pub claims_lost: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    fn add(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Processed => self.processed += 1,
            RecordOutcome::Duplicate => self.duplicates += 1,
            RecordOutcome::Retried => self.retried += 1,
            RecordOutcome::DeadLettered => self.dead_lettered += 1,
            RecordOutcome::Abandoned(_) => self.abandoned += 1,
            RecordOutcome::ClaimLost => self.claims_lost += 1,
        }
    }
}

/// Requests a graceful stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug)]
enum RecordOutcome {
    Processed,
    Duplicate,
    Retried,
    DeadLettered,
    Abandoned(String),
    ClaimLost,
}

struct GroupResult {
    outcomes: Vec<RecordOutcome>,
    error: Option<OutboxError>,
}

/// Drains the outbox table into the dispatch registry.
///
/// # Lifecycle
///
/// 1. Build with [`OutboxWorker::new()`]
/// 2. Either call [`run_cycle()`](Self::run_cycle) directly (tests, one-shot
///    tools) or [`start()`](Self::start) the background loop
/// 3. Stop via [`WorkerHandle::shutdown()`] or a [`ShutdownTrigger`]
pub struct OutboxWorker {
    db: AsyncDatabase,
    registry: Arc<DispatchRegistry>,
    config: WorkerConfig,
    shutdown: ShutdownTrigger,
}

impl OutboxWorker {
    pub fn new(
        db: AsyncDatabase,
        registry: Arc<DispatchRegistry>,
        config: WorkerConfig,
    ) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            db,
            registry,
            config,
            shutdown: ShutdownTrigger::new(),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Run one poll cycle as of `now`.
    ///
    /// Handler failures are recorded on the records and never returned. An
    /// `Err` means the store failed; records already transitioned keep their
    /// new state and the rest are picked up again once their claims lapse.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> OutboxResult<CycleReport> {
        let started = Instant::now();
        let claim = OutboxClaim {
            worker_id: self.config.worker_id.clone(),
            now,
            claimed_until: now + to_chrono(self.config.claim_ttl),
            limit: self.config.batch_size,
        };
        let records = self
            .db
            .transaction(move |tx| queries::claim_due_outbox_records(tx, &claim))
            .await?;

        let mut report = CycleReport {
            claimed: records.len(),
            ..CycleReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }
        debug!(worker_id = %self.config.worker_id, claimed = records.len(), "Claimed outbox batch");

        let groups: Vec<_> = group_by_key(records)
            .into_iter()
            .map(|group| self.process_group(group, now, started))
            .collect();
        let results: Vec<GroupResult> = stream::iter(groups)
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        let mut abandoned_ids = Vec::new();
        let mut first_error = None;
        for result in results {
            for outcome in &result.outcomes {
                report.add(outcome);
                if let RecordOutcome::Abandoned(id) = outcome {
                    abandoned_ids.push(id.clone());
                }
            }
            if first_error.is_none() {
                first_error = result.error;
            }
        }

        if !abandoned_ids.is_empty() {
            self.release_claims(abandoned_ids).await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn release_claims(&self, ids: Vec<String>) {
        let worker_id = self.config.worker_id.clone();
        let count = ids.len();
        match self
            .db
            .call(move |conn| queries::release_outbox_claims(conn, &worker_id, &ids))
            .await
        {
            Ok(released) => {
                info!(worker_id = %self.config.worker_id, released, "Released claims on unattempted records")
            }
            Err(e) => warn!(
                worker_id = %self.config.worker_id,
                count,
                error = %e,
                "Failed to release claims; they lapse with the lease"
            ),
        }
    }

    async fn process_group(
        &self,
        group: Vec<OutboxRecord>,
        now: DateTime<Utc>,
        started: Instant,
    ) -> GroupResult {
        let mut outcomes = Vec::with_capacity(group.len());
        let mut records = group.into_iter();

        while let Some(record) = records.next() {
            if self.shutdown.is_triggered() {
                outcomes.push(RecordOutcome::Abandoned(record.id));
                continue;
            }

            match self.process_record(record, now, started).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    outcomes.extend(records.map(|r| RecordOutcome::Abandoned(r.id)));
                    return GroupResult {
                        outcomes,
                        error: Some(e),
                    };
                }
            }
        }

        GroupResult {
            outcomes,
            error: None,
        }
    }

    async fn process_record(
        &self,
        record: OutboxRecord,
        now: DateTime<Utc>,
        started: Instant,
    ) -> OutboxResult<RecordOutcome> {
        if !self.renew_claim(&record, now, started).await? {
            warn!(
                worker_id = %self.config.worker_id,
                record_id = %record.id,
                "Claim taken over before dispatch; skipping record"
            );
            return Ok(RecordOutcome::ClaimLost);
        }

        if let Some(key) = record.idempotency_key.clone() {
            let seen = self
                .db
                .call(move |conn| queries::is_idempotency_key_processed(conn, &key))
                .await?;
            if seen {
                let marked = self.mark_processed(&record, clock(now, started)).await?;
                debug!(
                    record_id = %record.id,
                    idempotency_key = ?record.idempotency_key,
                    "Skipped duplicate outbox event"
                );
                return Ok(if marked {
                    RecordOutcome::Duplicate
                } else {
                    RecordOutcome::ClaimLost
                });
            }
        }

        let envelope = EventEnvelope::from(&record);
        let dispatched = self
            .registry
            .dispatch(&envelope, self.config.handler_timeout)
            .await;

        match dispatched {
            Ok(()) => {
                let marked = self.mark_processed(&record, clock(now, started)).await?;
                if marked {
                    debug!(record_id = %record.id, event_type = %record.event_type, "Delivered outbox event");
                    Ok(RecordOutcome::Processed)
                } else {
                    warn!(record_id = %record.id, "Claim lost before delivery could be recorded");
                    Ok(RecordOutcome::ClaimLost)
                }
            }
            Err(dispatch_error) => {
                let failed_at = clock(now, started);
                self.handle_failure(record, dispatch_error.to_string(), failed_at)
                    .await
            }
        }
    }

    /// Extend the lease so it outlasts the whole handler chain. Records can
    /// sit behind earlier work in the batch for longer than `claim_ttl`.
    async fn renew_claim(
        &self,
        record: &OutboxRecord,
        now: DateTime<Utc>,
        started: Instant,
    ) -> OutboxResult<bool> {
        let renewal = ClaimRenewal {
            record_id: record.id.clone(),
            worker_id: self.config.worker_id.clone(),
            expected_retry_count: record.retry_count,
            claimed_until: clock(now, started) + to_chrono(self.lease_for(&record.event_type)),
        };
        let renewed = self
            .db
            .call(move |conn| queries::renew_outbox_claim(conn, &renewal))
            .await?;
        Ok(renewed)
    }

    fn lease_for(&self, event_type: &str) -> Duration {
        let extra_handlers = self.registry.handler_count(event_type).saturating_sub(1);
        self.config.claim_ttl + self.config.handler_timeout * extra_handlers as u32
    }

    async fn mark_processed(&self, record: &OutboxRecord, at: DateTime<Utc>) -> OutboxResult<bool> {
        let id = record.id.clone();
        let worker_id = self.config.worker_id.clone();
        let marked = self
            .db
            .call(move |conn| queries::mark_outbox_record_processed(conn, &id, &worker_id, at))
            .await?;
        Ok(marked)
    }

    async fn handle_failure(
        &self,
        record: OutboxRecord,
        last_error: String,
        failed_at: DateTime<Utc>,
    ) -> OutboxResult<RecordOutcome> {
        match record_failure(
            record.retry_count,
            failed_at,
            self.config.max_retries,
            &self.config.backoff,
        ) {
            FailureOutcome::Retry {
                retry_count,
                next_retry_at,
            } => {
                let schedule = RetrySchedule {
                    record_id: record.id.clone(),
                    worker_id: self.config.worker_id.clone(),
                    expected_retry_count: record.retry_count,
                    retry_count,
                    last_error: last_error.clone(),
                    next_retry_at,
                };
                let applied = self
                    .db
                    .call(move |conn| queries::schedule_outbox_retry(conn, &schedule))
                    .await?;
                if !applied {
                    warn!(record_id = %record.id, "Claim lost before retry could be recorded");
                    return Ok(RecordOutcome::ClaimLost);
                }

                warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    error = %last_error,
                    "Outbox dispatch failed; retry scheduled"
                );
                Ok(RecordOutcome::Retried)
            }
            FailureOutcome::DeadLetter {
                total_retry_attempts,
            } => {
                let promotion = DeadLetterPromotion {
                    dead_letter_id: Uuid::new_v4().to_string(),
                    record_id: record.id.clone(),
                    worker_id: self.config.worker_id.clone(),
                    expected_retry_count: record.retry_count,
                    total_retry_attempts,
                    last_error: last_error.clone(),
                    moved_at: failed_at,
                };
                let moved = self
                    .db
                    .transaction(move |tx| queries::promote_to_dead_letter(tx, &promotion))
                    .await?;

                match moved {
                    Some(dead_letter) => {
                        error!(
                            record_id = %record.id,
                            dead_letter_id = %dead_letter.id,
                            event_type = %record.event_type,
                            total_retry_attempts,
                            error = %last_error,
                            "Outbox event moved to dead letter"
                        );
                        Ok(RecordOutcome::DeadLettered)
                    }
                    None => {
                        warn!(record_id = %record.id, "Claim lost before dead-lettering");
                        Ok(RecordOutcome::ClaimLost)
                    }
                }
            }
        }
    }

    /// Spawn the polling loop.
    ///
    /// The first cycle runs after a random delay below one `poll_interval`,
    /// so instances started together do not poll in lockstep; later cycles
    /// follow every `poll_interval`. A cycle that fails on the store is
    /// logged and retried on the next tick.
    pub fn start(self) -> WorkerHandle {
        let trigger = self.shutdown.clone();
        let join = tokio::spawn(self.run_loop());
        WorkerHandle { trigger, join }
    }

    async fn run_loop(self) {
        let mut stop = self.shutdown.subscribe();
        let first_tick = tokio::time::Instant::now() + startup_jitter(self.config.poll_interval);
        let mut ticker = interval_at(first_tick, self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: u64 = 0;

        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            handlers = self.registry.event_types().len(),
            "Outbox worker started"
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }

            if self.shutdown.is_triggered() {
                break;
            }

            cycles += 1;
            match self.run_cycle(Utc::now()).await {
                Ok(report) if report.is_idle() => {}
                Ok(report) => info!(
                    worker_id = %self.config.worker_id,
                    claimed = report.claimed,
                    processed = report.processed,
                    duplicates = report.duplicates,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    abandoned = report.abandoned,
                    claims_lost = report.claims_lost,
                    "Outbox cycle complete"
                ),
                Err(e) => warn!(
                    worker_id = %self.config.worker_id,
                    error = %e,
                    "Outbox cycle failed; retrying on next tick"
                ),
            }

            if self.purge_due(cycles) {
                self.purge_processed().await;
            }
        }

        info!(worker_id = %self.config.worker_id, cycles, "Outbox worker stopped");
    }

    fn purge_due(&self, cycles: u64) -> bool {
        self.config.processed_retention.is_some()
            && self.config.purge_every_cycles > 0
            && cycles % u64::from(self.config.purge_every_cycles) == 0
    }

    async fn purge_processed(&self) {
        let Some(retention) = self.config.processed_retention else {
            return;
        };
        if let Err(e) = maintenance::purge_processed(&self.db, Utc::now() - retention).await {
            warn!(error = %e, "Failed to purge processed outbox records");
        }
    }
}

/// Handle to a started worker.
pub struct WorkerHandle {
    trigger: ShutdownTrigger,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request a stop and wait for the in-flight cycle to wind down.
    pub async fn shutdown(self) {
        self.trigger.trigger();
        if let Err(e) = self.join.await {
            error!(error = %e, "Outbox worker task ended abnormally");
        }
    }
}

/// Split a claimed batch into per-key groups, preserving creation order.
/// Records without a key each form their own group.
fn group_by_key(records: Vec<OutboxRecord>) -> Vec<Vec<OutboxRecord>> {
    let mut groups: Vec<Vec<OutboxRecord>> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for record in records {
        match record.idempotency_key.clone() {
            Some(key) => match by_key.get(&key) {
                Some(&index) => groups[index].push(record),
                None => {
                    by_key.insert(key, groups.len());
                    groups.push(vec![record]);
                }
            },
            None => groups.push(vec![record]),
        }
    }
    groups
}

fn startup_jitter(poll_interval: Duration) -> Duration {
    let max_ms = poll_interval.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Cycle time advanced by the wall time spent so far in the cycle.
fn clock(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    now + to_chrono(started.elapsed())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
