//! Taskhub outbox - delivers domain events and manages dead letters.

mod app;
mod audit;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use taskhub_config_and_utils::{init_logging, parse_level, Config, Paths};
use taskhub_database::AsyncDatabase;

/// Taskhub outbox command-line interface.
#[derive(Parser)]
#[command(name = "taskhub-outbox")]
#[command(about = "Deliver Taskhub domain events and manage dead letters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.taskhub
    #[arg(long, global = true, env = "TASKHUB_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the outbox worker until interrupted
    Run {
        /// Identity written into claims. Defaults to a random ID.
        #[arg(long)]
        worker_id: Option<String>,
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Inspect and manage dead letters
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
    /// Show record counts
    Stats,
    /// Delete processed records older than the retention window
    Purge {
        /// Retention in days. Defaults to outbox.processed_retention_days.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Enqueue an event in its own transaction
    Enqueue {
        #[arg(long)]
        event_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommand {
    /// List dead letters, most recent first
    List {
        #[arg(long)]
        event_type: Option<String>,
        /// Only dead letters moved at or after this RFC 3339 time
        #[arg(long)]
        after: Option<DateTime<Utc>>,
        /// Only dead letters moved before this RFC 3339 time
        #[arg(long)]
        before: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one dead letter with its payload
    Show { id: String },
    /// Re-enqueue a dead letter as a fresh outbox record
    Retry { id: String },
    /// Permanently delete a dead letter
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    let level = parse_level(&config.log_level).as_str().to_lowercase();

    // Admin commands print results to stdout; only the worker logs to stderr.
    let is_worker = matches!(cli.command, Commands::Run { .. });
    init_logging("taskhub-outbox", &level, &paths, is_worker)?;

    let db = AsyncDatabase::open(&config.database_path(&paths)).await?;

    match cli.command {
        Commands::Run { worker_id, once } => {
            app::run_worker(db, &config, worker_id, once).await?;
        }
        Commands::DeadLetter(command) => match command {
            DeadLetterCommand::List {
                event_type,
                after,
                before,
                limit,
                offset,
            } => {
                app::admin::list_dead_letters(db, event_type, after, before, limit, offset).await?;
            }
            DeadLetterCommand::Show { id } => app::admin::show_dead_letter(db, &id).await?,
            DeadLetterCommand::Retry { id } => app::admin::retry_dead_letter(db, &id).await?,
            DeadLetterCommand::Delete { id } => app::admin::delete_dead_letter(db, &id).await?,
        },
        Commands::Stats => app::admin::print_stats(db).await?,
        Commands::Purge { older_than_days } => {
            let days = older_than_days.unwrap_or(config.outbox.processed_retention_days);
            app::admin::purge(db, days).await?;
        }
        Commands::Enqueue {
            event_type,
            payload,
            key,
        } => {
            app::admin::enqueue_json(db, event_type, payload, key).await?;
        }
    }

    Ok(())
}
