//! Structured logging infrastructure for SonicWave.
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
/// use sonicwave_core::logging;
///
/// logging::init();
/// tracing::info!("Node started");
/// ```
pub fn init() {
    init_with_default("info", false);
}

/// Initialize the logging system with JSON output for field deployments
/// that ship logs to an aggregator.
///
/// # Example
/// ```no_run
/// use sonicwave_core::logging;
///
/// logging::init_json();
/// tracing::info!(node_id = "node-7", "Relay engine online");
/// ```
pub fn init_json() {
    init_with_default("info", true);
}

/// Initialize logging from the `[logging]` section of the node config.
///
/// `RUST_LOG` still wins over the configured level when it is set.
pub fn init_from_config(config: &LoggingConfig) {
    init_with_default(&config.level, config.json);
}

fn init_with_default(default_level: &str, json: bool) {
    let filter = build_filter(default_level);
    let registry = tracing_subscriber::registry().with(filter);

    // A second initialisation in the same process is ignored.
    let _ = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_directives() {
        if std::env::var_os("RUST_LOG").is_none() {
            let filter = build_filter("sonicwave_mesh=debug,warn");
            assert!(filter.to_string().contains("sonicwave_mesh=debug"));
        }
    }

    #[test]
    fn test_init_twice_doesnt_panic() {
        init();
        init_json();
    }
}
