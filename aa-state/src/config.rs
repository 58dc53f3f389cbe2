//! Configuration for the state engine.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::EngineError;

/// Configuration for an [`AaStateEngine`](crate::AaStateEngine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Oracle cache configuration
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Event bus configuration
    #[serde(default)]
    pub events: EventsConfig,
    /// Response verification configuration
    #[serde(default)]
    pub verification: VerificationConfig,
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Check values the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.events.capacity == 0 {
            return Err(EngineError::Config("events.capacity must be positive".into()));
        }
        if self.verification.drift_warn_threshold.is_nan()
            || self.verification.drift_warn_threshold < 0.0
        {
            return Err(EngineError::Config(
                "verification.drift_warn_threshold must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Load config from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Oracle cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Minimum time between two fetches of the same feed (seconds)
    pub cooldown_secs: u64,
    /// How far back feed history is kept (seconds of ledger time)
    pub history_window_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            history_window_secs: 12 * 3600, // 12 hours
        }
    }
}

impl OracleConfig {
    /// Fetch cooldown as a duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it starts lagging
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Response verification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Record predictions and compare them with confirmed responses
    pub enabled: bool,
    /// Field differences above this are logged as warnings, below as debug
    pub drift_warn_threshold: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drift_warn_threshold: 0.0,
        }
    }
}
