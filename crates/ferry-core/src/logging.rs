//! Tracing subscriber setup.
//!
//! Every reactor logs through `tracing`; nothing is printed until one of
//! these functions installs a subscriber. `RUST_LOG` always wins over the
//! level passed in:
//!
//! ```bash
//! RUST_LOG=ferry_core=debug ferry
//! RUST_LOG=ferry_core::connection=trace ferry
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LogFormat};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Compact logging at `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Compact logging at `level` (`"trace"`, `"debug"`, `"info"`, ...).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Multi-line, human-oriented output with thread ids and line numbers.
pub fn init_logging_pretty(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true),
        )
        .init();
}

/// One JSON object per event, for log aggregation.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}

/// Install the subscriber described by `config`.
pub fn init_from_config(config: &Config) {
    match config.log_format {
        LogFormat::Compact => init_logging_with_level(&config.log_level),
        LogFormat::Pretty => init_logging_pretty(&config.log_level),
        LogFormat::Json => init_logging_json(&config.log_level),
    }
}
