//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimiterRules;

/// Main configuration for the Turnstile binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter windows and sizing
    #[serde(default)]
    pub limiter: LimiterRules,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TimeUnit;

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.limiter.max_cache_size, 10_000);
        assert_eq!(config.limiter.windows.len(), 2);
    }

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
limiter:
  max_cache_size: 2048
  windows:
    - requests_per_unit: 3
      unit: minute
logging:
  level: debug
  json: true
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.max_cache_size, 2048);
        assert_eq!(config.limiter.windows[0].unit, TimeUnit::Minute);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiter.backoff_multiplier, 2.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file() {
        let result = TurnstileConfig::from_file("/nonexistent/turnstile.yaml");
        assert!(matches!(result, Err(TurnstileError::Io(_))));
    }
}
