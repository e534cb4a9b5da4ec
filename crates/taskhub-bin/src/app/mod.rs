//! Worker startup and operator commands.

pub mod admin;

use crate::audit::AuditLogHandler;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use taskhub_config_and_utils::{Config, OutboxSettings};
use taskhub_database::AsyncDatabase;
use taskhub_outbox::{
    event_types, BackoffPolicy, DispatchRegistry, EventHandler, OutboxWorker, RegistryError,
    WorkerConfig,
};
use tracing::info;

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Translate file/env settings into worker tuning.
pub fn worker_config(settings: &OutboxSettings, worker_id: Option<String>) -> WorkerConfig {
    let defaults = WorkerConfig::default();
    WorkerConfig {
        poll_interval: Duration::from_secs(settings.poll_interval_secs),
        batch_size: settings.batch_size,
        max_retries: settings.max_retries,
        backoff: BackoffPolicy {
            base: Duration::from_secs(settings.backoff_base_secs),
            max: Duration::from_secs(settings.backoff_max_secs),
        },
        handler_timeout: Duration::from_secs(settings.handler_timeout_secs),
        claim_ttl: Duration::from_secs(settings.claim_ttl_secs),
        max_concurrency: settings.max_concurrency,
        worker_id: worker_id.unwrap_or(defaults.worker_id),
        processed_retention: Some(chrono::Duration::days(i64::from(
            settings.processed_retention_days,
        ))),
        purge_every_cycles: settings.purge_every_cycles,
    }
}

/// Register the audit handler for every configured event type.
pub fn build_registry(settings: &OutboxSettings) -> Result<DispatchRegistry, RegistryError> {
    let tags: Vec<String> = if settings.audit_event_types.is_empty() {
        event_types::ALL.iter().map(|t| t.to_string()).collect()
    } else {
        settings.audit_event_types.clone()
    };

    let audit: Arc<dyn EventHandler> = Arc::new(AuditLogHandler);
    let mut builder = DispatchRegistry::builder();
    for event_type in &tags {
        builder.register_shared(event_type, audit.clone())?;
    }
    builder.expect_event_types(tags);
    builder.build()
}

pub async fn run_worker(
    db: AsyncDatabase,
    config: &Config,
    worker_id: Option<String>,
    once: bool,
) -> AppResult<()> {
    let registry = Arc::new(build_registry(&config.outbox)?);
    let worker = OutboxWorker::new(db, registry, worker_config(&config.outbox, worker_id))?;

    if once {
        let report = worker.run_cycle(Utc::now()).await?;
        println!(
            "claimed={} processed={} duplicates={} retried={} dead_lettered={}",
            report.claimed, report.processed, report.duplicates, report.retried, report.dead_lettered
        );
        return Ok(());
    }

    let handle = worker.start();
    shutdown_signal().await?;
    info!("Shutdown signal received, stopping outbox worker");
    handle.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
