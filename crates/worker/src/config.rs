//! Worker settings: the engine sections plus `[log]`.

use serde::Deserialize;

use orderflow_infra::EngineConfig;
use orderflow_infra::config::{ConfigError, DEFAULT_CONFIG_FILE, load_settings};
use orderflow_observability::LogConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub log: LogConfig,
    /// Publish notifications on the in-process bus and log each one
    pub log_notifications: bool,
}

impl WorkerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        load_settings(DEFAULT_CONFIG_FILE)
    }
}
