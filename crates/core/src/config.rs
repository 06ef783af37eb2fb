use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds a request may wait for its reply before it fails.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Capacity of the outbound wire channel.
    #[serde(default = "default_wire_buffer")]
    pub wire_buffer: usize,
    /// History limits requested on join when the caller passes none.
    pub history: Option<HistoryConfig>,
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            wire_buffer: default_wire_buffer(),
            history: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryConfig {
    pub max_chars: Option<u32>,
    pub max_stanzas: Option<u32>,
    pub seconds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    log_level: Option<String>,
    request_timeout_secs: Option<String>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_wire_buffer() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[session]
request_timeout_secs = 30
sweep_interval_ms = 500
wire_buffer = 64

# [session.history]
# max_stanzas = 20

[logging]
level = "info"
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "waddle", "waddle-muc") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. A missing file is created with
/// the defaults and the defaults are returned.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path.as_ref(), config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(path)?;
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        log_level: std::env::var("WADDLE_MUC_LOG_LEVEL").ok(),
        request_timeout_secs: std::env::var("WADDLE_MUC_REQUEST_TIMEOUT_SECS").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    if let Some(raw) = overrides.request_timeout_secs {
        config.session.request_timeout_secs =
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "session.request_timeout_secs".to_string(),
                    message: format!("'{raw}' is not a whole number of seconds"),
                })?;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.session.request_timeout_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "session.request_timeout_secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.session.sweep_interval_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "session.sweep_interval_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.session.wire_buffer == 0 {
        return Err(ConfigError::InvalidValue {
            field: "session.wire_buffer".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
