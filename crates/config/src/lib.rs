//! Configuration loading and validation for runloop.
//!
//! Loads configuration from `~/.runloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.runloop/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default model for new runs
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Run loop settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry policy for chat-completion calls
    #[serde(default)]
    pub llm_retry: RetryConfig,

    /// Context-window truncation
    #[serde(default)]
    pub truncation: TruncationConfig,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Planner iterations allowed per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Wall-clock budget per run; no deadline when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Tool handlers running at once within a batch
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,

    /// Chat-completion calls in flight across all runs
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,

    #[serde(default = "default_output_poll_interval_ms")]
    pub output_poll_interval_ms: u64,

    /// How long the driver waits for the output stream to flush
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Capacity of the outward event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_steps() -> u32 {
    25
}
fn default_tool_concurrency() -> usize {
    8
}
fn default_llm_concurrency() -> usize {
    4
}
fn default_output_poll_interval_ms() -> u64 {
    20
}
fn default_flush_timeout_ms() -> u64 {
    2000
}
fn default_event_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            run_timeout_secs: None,
            tool_concurrency: default_tool_concurrency(),
            llm_concurrency: default_llm_concurrency(),
            output_poll_interval_ms: default_output_poll_interval_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Input budget for models without an entry in `models`
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,

    /// Shortening passes over the protected set before giving up
    #[serde(default = "default_shorten_attempts")]
    pub shorten_attempts: u32,

    /// Per-model input budgets
    #[serde(default)]
    pub models: HashMap<String, ModelLimits>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_input_tokens: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_input_tokens() -> usize {
    8192
}
fn default_shorten_attempts() -> u32 {
    5
}

impl TruncationConfig {
    /// Input budget for `model`, falling back to the global limit.
    pub fn max_input_tokens_for(&self, model: &str) -> usize {
        self.models
            .get(model)
            .map(|m| m.max_input_tokens)
            .unwrap_or(self.max_input_tokens)
    }
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_input_tokens: default_max_input_tokens(),
            shorten_attempts: default_shorten_attempts(),
            models: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.runloop/config.toml).
    ///
    /// Environment overrides, applied after the file:
    /// - `RUNLOOP_MODEL`
    /// - `RUNLOOP_MAX_STEPS`
    /// - `RUNLOOP_TRUNCATION` (`on` / `off`)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides read through `lookup` (normally the process environment).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("RUNLOOP_MODEL") {
            self.default_model = model;
        }

        if let Some(raw) = lookup("RUNLOOP_MAX_STEPS") {
            self.engine.max_steps = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "RUNLOOP_MAX_STEPS must be a positive integer, got '{raw}'"
                ))
            })?;
        }

        if let Some(raw) = lookup("RUNLOOP_TRUNCATION") {
            self.truncation.enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "RUNLOOP_TRUNCATION must be 'on' or 'off', got '{raw}'"
                    )));
                }
            };
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".runloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.engine.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_steps must be > 0".into(),
            ));
        }

        if self.engine.tool_concurrency == 0 || self.engine.llm_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "engine.tool_concurrency and engine.llm_concurrency must be > 0".into(),
            ));
        }

        if self.llm_retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "llm_retry.max_attempts must be > 0".into(),
            ));
        }

        if self.truncation.max_input_tokens == 0
            || self.truncation.models.values().any(|m| m.max_input_tokens == 0)
        {
            return Err(ConfigError::ValidationError(
                "truncation.max_input_tokens must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        Self::default().to_toml()
    }

    /// Render this configuration as TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_temperature: default_temperature(),
            engine: EngineConfig::default(),
            llm_retry: RetryConfig::default(),
            truncation: TruncationConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_steps, 25);
        assert_eq!(config.llm_retry.max_attempts, 3);
        assert!(config.truncation.enabled);
        assert!(config.engine.run_timeout_secs.is_none());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_model, config.default_model);
        assert_eq!(parsed.engine.event_buffer, config.engine.event_buffer);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_limits_rejected() {
        let mut config = AppConfig::default();
        config.engine.max_steps = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.tool_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.llm_retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.truncation.max_input_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.default_model, "gpt-4o-mini");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
default_model = "local-llm"

[engine]
max_steps = 4
run_timeout_secs = 30

[truncation.models."local-llm"]
max_input_tokens = 2048
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.default_model, "local-llm");
        assert_eq!(config.engine.max_steps, 4);
        assert_eq!(config.engine.run_timeout_secs, Some(30));
        assert_eq!(config.engine.tool_concurrency, 8);
        assert_eq!(config.truncation.max_input_tokens_for("local-llm"), 2048);
        assert_eq!(config.truncation.max_input_tokens_for("other"), 8192);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[engine\nmax_steps = ").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "RUNLOOP_MODEL" => Some("override-model".into()),
                "RUNLOOP_MAX_STEPS" => Some("7".into()),
                "RUNLOOP_TRUNCATION" => Some("off".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.default_model, "override-model");
        assert_eq!(config.engine.max_steps, 7);
        assert!(!config.truncation.enabled);
    }

    #[test]
    fn bad_env_override_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "RUNLOOP_TRUNCATION").then(|| "maybe".into()))
            .unwrap_err();
        assert!(err.to_string().contains("RUNLOOP_TRUNCATION"));

        let err = config
            .apply_env_overrides(|key| (key == "RUNLOOP_MAX_STEPS").then(|| "lots".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("[engine]"));
        assert!(toml_str.contains("max_steps = 25"));
    }
}
