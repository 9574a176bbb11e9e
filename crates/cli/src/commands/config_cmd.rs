//! `switchyard config`: Configuration management commands.

use std::path::{Path, PathBuf};

use switchyard_config::{AppConfig, ConfigError};

/// Load from `path` when given, otherwise from the default location.
pub fn load(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    }
}

pub fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Render the config as TOML with the API key masked.
pub fn redacted_toml(config: &AppConfig) -> Result<String, toml::ser::Error> {
    let mut config = config.clone();
    if config.provider.api_key.is_some() {
        config.provider.api_key = Some("********".into());
    }
    toml::to_string_pretty(&config)
}

pub fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating {}...", config_path(path).display());

    match load(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            if config.has_api_key() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                println!(
                    "   ⚠️  No API key set (set SWITCHYARD_API_KEY, OPENAI_API_KEY or OPENROUTER_API_KEY)"
                );
            }

            println!();
            println!("   Provider:  {}", config.provider.name);
            println!("   Endpoint:  {}", config.provider.base_url);
            println!("   Model:     {}", config.provider.model);
            println!("   Retries:   {}", config.agent.max_retries);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(path).map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", redacted_toml(&config)?);
    Ok(())
}

pub fn path(path: Option<&Path>) {
    println!("{}", config_path(path).display());
}
