//! Logging initialization.
//!
//! Library code only emits `tracing` events. Binaries call one of the init
//! functions once at startup; the `RUST_LOG` environment variable always wins
//! over the configured default level.

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, logged once at startup.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    pub default_level: String,

    /// Emit one JSON object per line instead of compact text.
    pub json: bool,

    /// Include the event target (module path) in every line.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "remote-proxy".into(),
            default_level: "info".into(),
            json: false,
            with_target: true,
        }
    }
}

/// Initialize compact logging at the given default level.
pub fn init_logging(level: &str) {
    init_with_config(LogConfig {
        default_level: level.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_with_config(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let installed = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .json()
            .finish()
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .compact()
            .finish()
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!(service = %config.service_name, "Logging initialized");
    }
}
