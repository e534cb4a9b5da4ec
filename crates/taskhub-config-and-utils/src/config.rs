//! Configuration management for the outbox processes.
//!
//! Values come from `~/.taskhub/config.json` (all fields optional) and are
//! then overridden by `TASKHUB_*` environment variables.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// SQLite database path. Defaults to `~/.taskhub/taskhub.sqlite`.
    pub database_path: Option<PathBuf>,
    /// Outbox worker tuning.
    pub outbox: OutboxSettings,
}

/// Outbox worker settings, expressed in whole seconds for readability in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Base of the exponential backoff; retry `n` waits `base * 2^n`.
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub handler_timeout_secs: u64,
    /// How long a claimed batch stays reserved for one worker.
    pub claim_ttl_secs: u64,
    /// Number of idempotency-key groups dispatched in parallel.
    pub max_concurrency: usize,
    /// Processed records older than this are purged.
    pub processed_retention_days: u32,
    /// Purge runs once every N poll cycles. Zero disables it.
    pub purge_every_cycles: u32,
    /// Event types routed to the built-in audit handler. Empty means every
    /// built-in business event type.
    pub audit_event_types: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_path: None,
            outbox: OutboxSettings::default(),
        }
    }
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 50,
            max_retries: 3,
            backoff_base_secs: 60,
            backoff_max_secs: 3600,
            handler_timeout_secs: 30,
            claim_ttl_secs: 300,
            max_concurrency: 4,
            processed_retention_days: 7,
            purge_every_cycles: 720,
            audit_event_types: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the config file (if present), then apply
    /// environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Resolve the database path, falling back to the default location.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Override values from environment variables.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).and_then(non_empty_env);

        if let Some(level) = get("TASKHUB_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(path) = get("TASKHUB_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }

        let outbox = &mut self.outbox;
        override_parsed(&get, "TASKHUB_OUTBOX_POLL_INTERVAL_SECS", &mut outbox.poll_interval_secs)?;
        override_parsed(&get, "TASKHUB_OUTBOX_BATCH_SIZE", &mut outbox.batch_size)?;
        override_parsed(&get, "TASKHUB_OUTBOX_MAX_RETRIES", &mut outbox.max_retries)?;
        override_parsed(&get, "TASKHUB_OUTBOX_BACKOFF_BASE_SECS", &mut outbox.backoff_base_secs)?;
        override_parsed(
            &get,
            "TASKHUB_OUTBOX_HANDLER_TIMEOUT_SECS",
            &mut outbox.handler_timeout_secs,
        )?;
        Ok(())
    }

    /// Reject settings that would stall or disable the worker.
    pub fn validate(&self) -> CoreResult<()> {
        let o = &self.outbox;
        let zero_checks: [(&str, u64); 7] = [
            ("poll_interval_secs", o.poll_interval_secs),
            ("batch_size", o.batch_size as u64),
            ("max_retries", u64::from(o.max_retries)),
            ("backoff_base_secs", o.backoff_base_secs),
            ("handler_timeout_secs", o.handler_timeout_secs),
            ("claim_ttl_secs", o.claim_ttl_secs),
            ("max_concurrency", o.max_concurrency as u64),
        ];
        for (name, value) in zero_checks {
            if value == 0 {
                return Err(CoreError::Config(format!("outbox.{name} must be greater than zero")));
            }
        }
        if o.backoff_max_secs < o.backoff_base_secs {
            return Err(CoreError::Config(
                "outbox.backoff_max_secs must not be smaller than outbox.backoff_base_secs"
                    .to_string(),
            ));
        }
        if o.claim_ttl_secs <= o.handler_timeout_secs {
            return Err(CoreError::Config(
                "outbox.claim_ttl_secs must exceed outbox.handler_timeout_secs".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<T, G>(get: &G, name: &str, target: &mut T) -> CoreResult<()>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *target = raw
            .parse()
            .map_err(|_| CoreError::Config(format!("{name} has invalid value '{raw}'")))?;
    }
    Ok(())
}

fn non_empty_env(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
