//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `CHATTERBRAIN_*` environment overrides.

use crate::sqlbrain::{SqlBrainConfig, DEFAULT_MAX_SPEAK_LEN};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub brain: BrainConfig,

    #[serde(default)]
    pub userhash: UserHashConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tuple store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrainConfig {
    #[serde(default = "default_path")]
    pub path: String,

    /// Order used by `init` when none is given
    #[serde(default = "default_order")]
    pub order: i64,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,

    #[serde(default = "default_max_speak_len")]
    pub max_speak_len: usize,
}

fn default_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chatterbrain").join("brain.db").to_string_lossy().to_string())
        .unwrap_or_else(|| "./brain.db".to_string())
}

fn default_order() -> i64 {
    2
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout() -> u32 {
    5000
}

fn default_max_speak_len() -> usize {
    DEFAULT_MAX_SPEAK_LEN
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            order: default_order(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout(),
            max_speak_len: default_max_speak_len(),
        }
    }
}

impl BrainConfig {
    /// Database path with a leading `~` expanded to the home directory
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.path, dirs::home_dir())
    }

    pub fn to_store_config(&self) -> SqlBrainConfig {
        SqlBrainConfig {
            path: self.db_path(),
            pool_size: self.pool_size,
            busy_timeout_ms: self.busy_timeout_ms,
            max_speak_len: self.max_speak_len,
        }
    }
}

fn expand_home(path: &str, home: Option<PathBuf>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}

/// Key for hashing user identities
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserHashConfig {
    #[serde(default)]
    pub secret: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// How log lines are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human readable
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl LoggingConfig {
    /// Parsed `format`. Unknown values fall back to `Pretty`.
    pub fn log_format(&self) -> LogFormat {
        match self.format.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_overrides(|k| std::env::var(k).ok());
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|k| std::env::var(k).ok());
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chatterbrain").join("config.toml")),
            Some(PathBuf::from("./chatterbrain.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::debug!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply overrides looked up by variable name. Unparseable numbers are
    /// ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("CHATTERBRAIN_DB") {
            self.brain.path = path;
        }
        if let Some(order) = var("CHATTERBRAIN_ORDER").and_then(|v| v.parse().ok()) {
            self.brain.order = order;
        }
        if let Some(n) = var("CHATTERBRAIN_MAX_SPEAK_LEN").and_then(|v| v.parse().ok()) {
            self.brain.max_speak_len = n;
        }
        if let Some(secret) = var("CHATTERBRAIN_SECRET") {
            self.userhash.secret = secret;
        }
        if let Some(level) = var("CHATTERBRAIN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("CHATTERBRAIN_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chatterbrain Configuration
#
# Environment variables override these settings:
# - CHATTERBRAIN_DB
# - CHATTERBRAIN_ORDER
# - CHATTERBRAIN_MAX_SPEAK_LEN
# - CHATTERBRAIN_SECRET
# - CHATTERBRAIN_LOG_LEVEL
# - CHATTERBRAIN_LOG_FORMAT

[brain]
# SQLite database holding the brain (a leading ~ is the home directory)
path = "~/.local/share/chatterbrain/brain.db"

# Prefix length for new brains; an existing brain keeps its own
order = 2

# Pooled database connections
pool_size = 8

# How long a writer waits on a locked database (ms)
busy_timeout_ms = 5000

# Stop generating once a message reaches this many characters
max_speak_len = 500

[userhash]
# Key for hashing user identities; keep it private
secret = ""

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development), compact (one line per event), or json (for production)
format = "pretty"
"#
    .to_string()
}
