//! Configuration loader from ~/.sdbg-settings.json.

use std::path::{Path, PathBuf};

use crate::config::schema::SandboxDebugConfig;
use crate::error::{ConfigError, SandboxError};

/// Default settings file name.
const DEFAULT_SETTINGS_FILE: &str = ".sdbg-settings.json";

/// Get the default settings file path.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SETTINGS_FILE))
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<SandboxDebugConfig, SandboxError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()).into());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError(format!("Failed to read config file: {}", e))
    })?;

    parse_config(&content)
}

/// Load configuration from the default path, or return default config if not found.
pub fn load_default_config() -> Result<SandboxDebugConfig, SandboxError> {
    match default_settings_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(SandboxDebugConfig::default()),
    }
}

/// Parse configuration from a JSON string.
pub fn parse_config(json: &str) -> Result<SandboxDebugConfig, SandboxError> {
    let config: SandboxDebugConfig = serde_json::from_str(json).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse config JSON: {}", e))
    })?;

    // Validate the configuration
    config.validate()?;

    Ok(config)
}
