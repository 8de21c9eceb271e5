use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML: {message}")]
    InvalidToml { message: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("could not determine a platform config directory")]
    NoConfigDir,

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Maximum messages retained per channel. Sized to cover roughly three
    /// pages either side of a jumped-to window.
    #[serde(default = "default_retention_limit")]
    pub retention_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_limit: default_retention_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionsConfig {
    /// Quiescence window before subscription diffs are pushed to the
    /// transport, so rapid channel switching coalesces into one call.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_retention_limit() -> usize {
    300
}

fn default_page_size() -> u32 {
    50
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_secs() -> u64 {
    60
}

fn default_debounce_ms() -> u64 {
    250
}

impl Config {
    /// Load configuration from an explicit path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load configuration from the platform config directory, falling back
    /// to defaults when no file exists.
    pub fn load_default() -> Result<Self, ConfigError> {
        let dirs = directories::ProjectDirs::from("", "", "concord")
            .ok_or(ConfigError::NoConfigDir)?;
        let path = dirs.config_dir().join("config.toml");
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw).map_err(|e| ConfigError::InvalidToml {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pagination.page_size == 0 || self.pagination.page_size > 100 {
            return Err(ConfigError::InvalidValue {
                field: "pagination.page_size".to_string(),
                message: "must be between 1 and 100".to_string(),
            });
        }
        if self.store.retention_limit < self.pagination.page_size as usize {
            return Err(ConfigError::InvalidValue {
                field: "store.retention_limit".to_string(),
                message: "must hold at least one page".to_string(),
            });
        }
        if self.event_bus.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_bus.channel_capacity".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
