//! Configuration loading, validation, and management for Switchyard.
//!
//! Loads configuration from `~/.switchyard/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.switchyard/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM provider connection
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Orchestrator behaviour
    #[serde(default)]
    pub agent: AgentSettings,
}

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name used in logs ("openai", "openrouter", "ollama", ...)
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (usually supplied through the environment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Timeout for a complete non-streaming request, and for the first
    /// byte of a streaming one
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Longest silence tolerated between two reads of a stream
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_stream_idle_timeout_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// System prompt sent ahead of every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Identical consecutive tool failures tolerated before the circuit
    /// breaker aborts the turn. With 1, the first failure goes back to the
    /// model and the next identical one trips.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Capacity of the bounded channel between a streaming turn and its reader
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Truncate tool results recorded by the in-memory task tracker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_result_max_chars: Option<usize>,
}

fn default_max_retries() -> u32 {
    1
}
fn default_stream_buffer() -> usize {
    64
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_retries: default_max_retries(),
            stream_buffer: default_stream_buffer(),
            task_result_max_chars: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.switchyard/config.toml),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply environment overrides:
    /// - `SWITCHYARD_API_KEY` / `OPENAI_API_KEY` / `OPENROUTER_API_KEY`
    ///   (first one set wins, only if the file has no key)
    /// - `SWITCHYARD_BASE_URL`
    /// - `SWITCHYARD_MODEL`
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
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

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = lookup("SWITCHYARD_API_KEY")
                .or_else(|| lookup("OPENAI_API_KEY"))
                .or_else(|| lookup("OPENROUTER_API_KEY"));
        }

        if let Some(base_url) = lookup("SWITCHYARD_BASE_URL") {
            self.provider.base_url = base_url;
        }

        if let Some(model) = lookup("SWITCHYARD_MODEL") {
            self.provider.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".switchyard")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.provider.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "provider.base_url must not be empty".into(),
            ));
        }

        if self.provider.request_timeout_secs == 0 || self.provider.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "provider timeouts must be greater than zero".into(),
            ));
        }

        if self.agent.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_retries must be at least 1".into(),
            ));
        }

        if self.agent.stream_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "agent.stream_buffer must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
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
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.max_retries, 1);
        assert_eq!(config.provider.request_timeout_secs, 120);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.provider.model, config.provider.model);
        assert_eq!(parsed.agent.stream_buffer, config.agent.stream_buffer);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.provider.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retries_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider.name, "openai");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[provider]
name = "ollama"
base_url = "http://localhost:11434/v1"
model = "llama3.1"

[agent]
max_retries = 3
system_prompt = "You are terse."
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.provider.name, "ollama");
        assert_eq!(config.provider.model, "llama3.1");
        assert_eq!(config.provider.request_timeout_secs, 120);
        assert_eq!(config.agent.max_retries, 3);
        assert_eq!(config.agent.system_prompt.as_deref(), Some("You are terse."));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[provider\nname = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-openai"),
            ("OPENROUTER_API_KEY", "sk-or"),
            ("SWITCHYARD_MODEL", "gpt-4o"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.provider.model, "gpt-4o");
        assert!(config.has_api_key());
    }

    #[test]
    fn file_api_key_wins_over_env() {
        let mut config = AppConfig::default();
        config.provider.api_key = Some("from-file".into());
        config.apply_env(|_| Some("from-env".into()));
        assert_eq!(config.provider.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.provider.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("max_retries"));
    }
}
