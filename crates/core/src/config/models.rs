//! Configuration models for `.queue-pipeline/config.toml`.
//!
//! # Example
//!
//! ```toml
//! # .queue-pipeline/config.toml
//! connection-setting = "PIPELINE_SERVICEBUS"
//! work-delay-ms = 1000
//! max-delivery-count = 10
//! max-concurrent-calls = 16
//!
//! [logging]
//! filter = "info,qp_core=debug"
//! format = "json"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::error::{ConfigError, ConfigResult};

/// Log output format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human-readable, for terminals.
    #[default]
    Pretty,
    /// One JSON object per line, for log collectors.
    Json,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when neither `QP_LOG` nor `RUST_LOG` is set.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Settings from `.queue-pipeline/config.toml`.
///
/// Every field has a default, so an empty or missing file is valid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct GlobalConfig {
    /// Name of the environment variable holding the broker connection string.
    pub connection_setting: String,

    /// Duration of the placeholder work each stage performs.
    pub work_delay_ms: u64,

    /// Deliveries attempted before a message is dead-lettered.
    pub max_delivery_count: u32,

    /// Concurrent invocations allowed per stage in worker mode.
    pub max_concurrent_calls: usize,

    pub logging: LoggingConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            connection_setting: "PIPELINE_SERVICEBUS".to_string(),
            work_delay_ms: 1000,
            max_delivery_count: 10,
            max_concurrent_calls: 16,
            logging: LoggingConfig::default(),
        }
    }
}

/// Unified application configuration loaded from `.queue-pipeline/`.
///
/// # Example
///
/// ```rust,no_run
/// use qp_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Stage delay: {:?}", config.work_delay());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// Settings from `config.toml`.
    pub global: GlobalConfig,
}

impl AppConfig {
    pub fn work_delay(&self) -> Duration {
        Duration::from_millis(self.global.work_delay_ms)
    }

    /// Resolve the broker connection string from the process environment.
    pub fn connection_string(&self) -> ConfigResult<String> {
        self.connection_string_with(|name| std::env::var(name).ok())
    }

    /// Resolve the broker connection string through `lookup`.
    pub fn connection_string_with<F>(&self, lookup: F) -> ConfigResult<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let setting = &self.global.connection_setting;
        lookup(setting)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingConnection {
                setting: setting.clone(),
            })
    }
}
