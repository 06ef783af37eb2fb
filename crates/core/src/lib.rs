pub mod config;
pub mod telemetry;

pub use config::{Config, ConfigError, HistoryConfig, LoggingConfig, SessionConfig};
pub use telemetry::TelemetryError;
