//! Structured logging infrastructure for the control plane.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use killswitch_core::logging;
///
/// logging::init();
/// tracing::info!("Verifier started");
/// ```
pub fn init() {
    init_with_level("info", false);
}

/// Initialize the logging system with JSON output for black-box collection.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
pub fn init_json() {
    init_with_level("info", true);
}

/// Initialize logging from the `[logging]` configuration section.
pub fn init_from_config(config: &LoggingConfig) {
    init_with_level(&config.level, config.json);
}

/// Initialize logging with a fallback level; `RUST_LOG` still takes precedence.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_with_level(default_level: &str, json: bool) {
    let filter = build_filter(default_level);

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
