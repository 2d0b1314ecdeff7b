//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events. Applications that do not bring
//! their own subscriber can install one from [`LoggingConfig`]:
//!
//! ```rust,no_run
//! use smithymq::config::SmithyConfig;
//!
//! let config = SmithyConfig::development();
//! smithymq::logging::init_logging(&config.logging).ok();
//! ```
//!
//! `RUST_LOG` directives are applied on top of the configured level.

use crate::config::LoggingConfig;
use crate::error::{SmithyError, SmithyResult};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Filter honouring `RUST_LOG`, defaulting to the configured level
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let level = LevelFilter::from_level(config.level.into());
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> SmithyResult<()> {
    let filter = env_filter(config);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let result = match (config.json_format, config.include_timestamps) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().without_time().try_init(),
        (false, true) => builder.with_ansi(config.colored).try_init(),
        (false, false) => builder.with_ansi(config.colored).without_time().try_init(),
    };
    result.map_err(|e| SmithyError::config(format!("Failed to install logger: {}", e)))
}
