//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `LogConfig::level`. Returns an error if a
/// global subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {}", config.level, e)))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {}", e)))
}

/// Install a test-friendly subscriber, ignoring "already installed" errors.
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("migration_coordinator=debug"))
        .with_test_writer()
        .try_init();
}
