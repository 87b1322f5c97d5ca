use crate::error::{ConvergeError, Result};
use std::path::Path;

use crate::config::paths::*;
use crate::config::schema::*;

/// Load the user configuration. A missing file yields the defaults.
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        tracing::debug!("No config file at {}, using defaults", config_path.display());
        return Ok(Config::default());
    }
    load_config_from(&config_path)
}

/// Load a configuration file given explicitly, e.g. with `--config`.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let toml_content = std::fs::read_to_string(path).map_err(|e| {
        ConvergeError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    toml::from_str(&toml_content)
        .map_err(|e| ConvergeError::Config(format!("Failed to parse config: {}", e)))
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConvergeError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ConvergeError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, toml_str)
        .map_err(|e| ConvergeError::Config(format!("Failed to write config file: {}", e)))?;
    Ok(())
}
