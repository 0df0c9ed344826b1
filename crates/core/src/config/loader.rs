//! Configuration file loader for the `.queue-pipeline/` directory.
//!
//! Only `config.toml` is read. Queue names and the stage sequence are fixed
//! in code and cannot be configured.

use crate::config::error::ConfigError;
use crate::config::error::ConfigResult;
use crate::config::models::{AppConfig, GlobalConfig};
use std::path::Path;

/// Name of the configuration directory under the project root.
pub const CONFIG_DIR: &str = ".queue-pipeline";

/// Loads all configuration from the `.queue-pipeline/` directory.
///
/// # Arguments
///
/// * `root` - Root directory containing the `.queue-pipeline/` folder
///
/// # Returns
///
/// An `AppConfig` with every setting resolved. If the directory or
/// `config.toml` is missing, returns the default configuration rather than
/// an error.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - `config.toml` exists but cannot be read
/// - `config.toml` has invalid TOML syntax or unknown value types
/// - A numeric limit is zero
pub async fn load_config(root: &Path) -> ConfigResult<AppConfig> {
    let qp_dir = root.join(CONFIG_DIR);

    // If .queue-pipeline doesn't exist, return default config
    if !qp_dir.exists() {
        return Ok(AppConfig::default());
    }

    let global = load_global_config(&qp_dir)?;

    Ok(AppConfig { global })
}

/// Loads global configuration from `config.toml`.
fn load_global_config(qp_dir: &Path) -> ConfigResult<GlobalConfig> {
    let config_path = qp_dir.join("config.toml");

    if !config_path.exists() {
        return Ok(GlobalConfig::default());
    }

    let content =
        std::fs::read_to_string(&config_path).map_err(|source| ConfigError::FileRead {
            path: config_path.clone(),
            source,
        })?;

    let config: GlobalConfig =
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: config_path.clone(),
            source,
        })?;

    let invalid = |reason: &str| ConfigError::InvalidConfig {
        path: config_path.clone(),
        reason: reason.to_string(),
    };

    if config.max_delivery_count == 0 {
        return Err(invalid("max-delivery-count must be at least 1"));
    }
    if config.max_concurrent_calls == 0 {
        return Err(invalid("max-concurrent-calls must be at least 1"));
    }
    if config.connection_setting.trim().is_empty() {
        return Err(invalid("connection-setting must name an environment variable"));
    }

    Ok(config)
}
