//! Logging setup for binaries and integration harnesses embedding the MUC
//! client.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to the
/// waddle crates and `warn` to everything else.
pub fn init(logging: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&logging.level)?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::debug!(level = %logging.level, "logging initialized");
    Ok(())
}

fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    let directives = default_directives(level);
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::InvalidFilter {
        filter: directives,
        message: e.to_string(),
    })
}

fn default_directives(level: &str) -> String {
    format!("warn,waddle_muc={level},waddle_muc_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_scope_level_to_waddle_crates() {
        assert_eq!(
            default_directives("debug"),
            "warn,waddle_muc=debug,waddle_muc_core=debug"
        );
    }

    #[test]
    fn builds_filter_for_valid_level() {
        assert!(build_filter("trace").is_ok());
    }
}
