//! Tracing/logging initialization.
//!
//! `RUST_LOG` wins over the configured filter when it is set.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::SystemTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,orderflow_infra=debug`
    pub filter: String,
    pub format: LogFormat,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
            with_target: false,
        }
    }
}

impl LogConfig {
    /// The filter to install: `RUST_LOG`, then `filter`, then `info`.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the process-wide subscriber.
///
/// Returns `false` when a subscriber was already installed; the call is then a no-op.
pub fn init(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_timer(SystemTime)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = LogConfig::default();
        init(&config);
        assert!(!init(&config));
    }

    #[test]
    fn bad_filter_falls_back_to_info() {
        let config = LogConfig {
            filter: "[not a filter".to_string(),
            ..LogConfig::default()
        };
        assert!(!config.env_filter().to_string().is_empty());
    }
}
