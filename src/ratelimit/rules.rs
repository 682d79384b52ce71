//! Declarative window rules.
//!
//! Rules are the serialized form of a limiter: a list of windows written as
//! "N requests per unit" plus cache sizing and backoff growth. They compile
//! into a validated [`LimiterConfig`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::state::{LimiterConfig, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_CACHE_SIZE};
use super::window::{TimeUnit, WindowConfig};
use crate::error::{Result, TurnstileError};

/// Rules for one limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterRules {
    /// Windows enforced together on every key
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowRule>,

    /// Maximum number of distinct keys tracked
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Growth factor applied per consecutive failure
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for LimiterRules {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            max_cache_size: default_max_cache_size(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// A single window rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRule {
    /// Number of attempts allowed per window
    pub requests_per_unit: u32,
    /// The time unit
    pub unit: TimeUnit,
    /// How many units one window spans
    #[serde(default = "default_units")]
    pub units: u32,
    /// Optional name/description for this window
    #[serde(default)]
    pub name: Option<String>,
}

impl WindowRule {
    /// Length of the window this rule describes.
    pub fn duration(&self) -> Duration {
        self.unit.duration().saturating_mul(self.units)
    }

    /// Validate this rule into a [`WindowConfig`].
    pub fn compile(&self) -> Result<WindowConfig> {
        if self.units == 0 {
            return Err(TurnstileError::Config(format!(
                "window {} must span at least one {:?}",
                self.name.as_deref().unwrap_or("<unnamed>"),
                self.unit
            )));
        }
        WindowConfig::new(self.duration(), self.requests_per_unit)
    }
}

fn default_windows() -> Vec<WindowRule> {
    vec![
        WindowRule {
            requests_per_unit: 5,
            unit: TimeUnit::Minute,
            units: 1,
            name: None,
        },
        WindowRule {
            requests_per_unit: 100,
            unit: TimeUnit::Hour,
            units: 1,
            name: None,
        },
    ]
}

fn default_max_cache_size() -> usize {
    DEFAULT_MAX_CACHE_SIZE
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_units() -> u32 {
    1
}

impl LimiterRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse limiter rules: {}", e)))
    }

    /// Validate the rules into a limiter configuration.
    pub fn compile(&self) -> Result<LimiterConfig> {
        let windows = self
            .windows
            .iter()
            .map(WindowRule::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(LimiterConfig::new(windows)
            .max_cache_size(self.max_cache_size)
            .backoff_multiplier(self.backoff_multiplier))
    }
}
