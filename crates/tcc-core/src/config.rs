//! Configuration system for TCC Sensor
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Collector URL resolution

use crate::batch::BatchConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Production collector
pub const PROD_TRACES_URL: &str = "https://api.thecontext.company/v1/traces";

/// Development collector, used for `dev_` API keys
pub const DEV_TRACES_URL: &str = "https://dev.thecontext.company/v1/traces";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TccConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Run batching settings
    pub batch: BatchSettings,

    /// Export settings
    pub export: ExportSettings,

    /// Local web transport settings
    pub web: WebSettings,
}

/// Sensor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Run batching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Seconds without a new span before a run is flushed
    pub idle_timeout_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
        }
    }
}

impl BatchSettings {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Export settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// OTLP/HTTP JSON collector export
    pub otlp: OtlpExportConfig,

    /// Local in-memory store for observers
    pub local: LocalExportConfig,

    /// JSONL file export
    pub jsonl: JsonlExportConfig,
}

/// OTLP/HTTP JSON export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtlpExportConfig {
    pub enabled: bool,

    /// Collector URL; derived from the API key when unset
    pub url: Option<String>,

    /// API key sent as a bearer token
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Retries for network errors and 5xx responses
    pub max_retries: u32,

    /// Extra request headers
    pub headers: HashMap<String, String>,
}

impl Default for OtlpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            api_key: None,
            timeout_secs: 10,
            max_retries: 3,
            headers: HashMap::new(),
        }
    }
}

impl OtlpExportConfig {
    /// Collector URL: an explicit URL wins, otherwise `dev_` keys go to the
    /// development collector
    pub fn resolved_url(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        match self.api_key.as_deref() {
            Some(key) if key.starts_with("dev_") => DEV_TRACES_URL.to_string(),
            _ => PROD_TRACES_URL.to_string(),
        }
    }
}

/// Local store export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalExportConfig {
    pub enabled: bool,

    /// Capacity of the delta broadcast channel
    pub buffer_size: usize,
}

impl Default for LocalExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 1024,
        }
    }
}

/// JSONL export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlExportConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for JsonlExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "tcc-batches.jsonl".to_string(),
        }
    }
}

/// Local web transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub enabled: bool,
    pub host: String,

    /// Port to try first; the preferred port list follows
    pub port: Option<u16>,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. TCC_CONFIG environment variable
    /// 3. ~/.config/tcc/config.toml
    /// 4. /etc/tcc/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<TccConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                TccConfig::default()
            }
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // 1. CLI --config flag
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        // 2. TCC_CONFIG environment variable
        if let Ok(env_path) = std::env::var("TCC_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("TCC_CONFIG path does not exist: {}", env_path);
        }

        // 3. ~/.config/tcc/config.toml
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        // 4. /etc/tcc/config.toml (Unix only)
        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/tcc/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<TccConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: TccConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut TccConfig) {
        self.apply_overrides(config, |key| std::env::var(key).ok());
    }

    fn apply_overrides(&self, config: &mut TccConfig, var: impl Fn(&str) -> Option<String>) {
        // Sensor settings
        if let Some(val) = var("TCC_LOG_LEVEL") {
            config.sensor.log_level = val;
        }
        if let Some(val) = var("TCC_DEBUG") {
            if val == "1" || val.eq_ignore_ascii_case("true") {
                config.sensor.log_level = "debug".to_string();
            }
        }

        // Batch settings
        if let Some(val) = var("TCC_IDLE_TIMEOUT_SECS") {
            match val.parse() {
                Ok(secs) => config.batch.idle_timeout_secs = secs,
                Err(_) => warn!("Ignoring invalid TCC_IDLE_TIMEOUT_SECS: {}", val),
            }
        }

        // OTLP settings
        if let Some(val) = var("TCC_API_KEY") {
            config.export.otlp.api_key = Some(val);
            config.export.otlp.enabled = true;
        }
        if let Some(val) = var("TCC_URL") {
            config.export.otlp.url = Some(val);
        }

        // JSONL settings
        if let Some(val) = var("TCC_JSONL_PATH") {
            config.export.jsonl.path = val;
            config.export.jsonl.enabled = true;
        }

        // Web settings
        if let Some(val) = var("TCC_WS_PORT") {
            match val.parse() {
                Ok(port) => config.web.port = Some(port),
                Err(_) => warn!("Ignoring invalid TCC_WS_PORT: {}", val),
            }
        }
        if let Some(val) = var("TCC_WEB_HOST") {
            config.web.host = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &TccConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.batch.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Batch idle timeout cannot be 0".to_string(),
            ));
        }

        let otlp = &config.export.otlp;
        if otlp.enabled {
            if otlp.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::ValidationError(
                    "OTLP export requires an API key (set TCC_API_KEY)".to_string(),
                ));
            }
            if otlp.timeout_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "OTLP timeout cannot be 0".to_string(),
                ));
            }
        }

        if config.export.jsonl.enabled && config.export.jsonl.path.is_empty() {
            return Err(ConfigError::ValidationError(
                "JSONL export requires a path".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &TccConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tcc").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "linux", target_os = "windows")))]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}
