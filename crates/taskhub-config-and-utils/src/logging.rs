//! Logging initialization for the outbox binaries.
//!
//! Every process writes structured JSONL to `~/.taskhub/logs/outbox.jsonl`
//! through the observability crate; stderr output is optional.

use crate::{CoreResult, Paths};

/// Initialize the logging system.
///
/// - Structured JSONL output to [`Paths::log_file`]
/// - Log level from RUST_LOG env var or the provided default
/// - `service_name` included in every log line
///
/// ```ignore
/// init_logging("outbox-worker", "info", &paths, true)?;
/// tracing::info!("Worker started");
/// ```
pub fn init_logging(
    service_name: &str,
    level: &str,
    paths: &Paths,
    also_stderr: bool,
) -> CoreResult<()> {
    paths.ensure_dirs()?;
    observability::init_with_config(observability::LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        log_path: Some(paths.log_file()),
        also_stderr,
    })?;
    Ok(())
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
