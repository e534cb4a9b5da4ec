//! Configuration, paths, and logging setup shared by the Taskhub outbox binaries.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, OutboxSettings, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
