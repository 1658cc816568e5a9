//! Configuration file loading and validation
//!
//! - [`load_config`] - Strict loader, errors if file missing
//! - [`load_config_from_str`] - Parse and validate TOML content
//! - [`load_config_or_default`] - Optional path, defaults when absent

use crate::ProxyConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors that can occur during config loading
#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Load configuration from a TOML file (strict - no side effects)
///
/// # Returns
/// * `Ok(ProxyConfig)` - Successfully loaded configuration
/// * `Err(ConfigError::NotFound)` - Config file does not exist
/// * `Err(ConfigError)` - Failed to read, parse or validate
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    debug!(path = %path.display(), "Loading config file");
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load from an explicit path, else from `DAPX_CONFIG`, else defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    let resolved = path
        .map(Path::to_path_buf)
        .or_else(crate::paths::config_path_from_env);

    match resolved {
        Some(path) => load_config(&path),
        None => {
            debug!("No config file given, using defaults");
            Ok(ProxyConfig::default())
        }
    }
}

/// Load configuration from a TOML string
pub fn load_config_from_str(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    let mut all_errors = Vec::new();

    if config.connection.max_connect_attempts == 0 {
        all_errors.push("connection.max_connect_attempts must be greater than 0".to_string());
    }

    if config.connection.request_timeout_ms == 0 {
        all_errors.push("connection.request_timeout_ms must be greater than 0".to_string());
    }

    if config.connection.event_channel_capacity == 0 {
        all_errors.push("connection.event_channel_capacity must be greater than 0".to_string());
    }

    for (name, overrides) in &config.connection.overrides {
        if overrides.max_connect_attempts == Some(0) {
            all_errors.push(format!(
                "connection.overrides.{}.max_connect_attempts must be greater than 0",
                name
            ));
        }
    }

    if config.child.attach_max_retries == 0 {
        all_errors.push("child.attach_max_retries must be greater than 0".to_string());
    }

    if config.bridge.host.trim().is_empty() {
        all_errors.push("bridge.host must not be empty".to_string());
    }

    if all_errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(all_errors.join("; ")))
    }
}
