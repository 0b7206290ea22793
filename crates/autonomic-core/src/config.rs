//! Loop configuration
//!
//! Read from TOML, then overridden from `AUTONOMIC_*` environment variables.

use crate::provider::HttpProviderConfig;
use crate::types::Stage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Topic per stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub audit: String,
    pub refine: String,
    pub evaluate: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            audit: "autonomic-audit-jobs".to_string(),
            refine: "autonomic-refine-jobs".to_string(),
            evaluate: "autonomic-eval-jobs".to_string(),
        }
    }
}

impl Topics {
    /// Topic carrying jobs of `stage`
    #[must_use]
    pub fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::Audit => &self.audit,
            Stage::Refine => &self.refine,
            Stage::Evaluate => &self.evaluate,
        }
    }
}

/// Control-loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Refine -> Evaluate attempts per episode before escalation
    pub max_attempts: u32,
    pub provider_timeout_ms: u64,
    /// Deliveries of one job before it is abandoned
    pub max_deliveries: u32,
    /// Ack deadline of a delivery
    pub lease_ms: u64,
    pub workers_per_stage: usize,
    pub topics: Topics,
    pub provider: HttpProviderConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            provider_timeout_ms: 30_000,
            max_deliveries: 3,
            lease_ms: 60_000,
            workers_per_stage: 4,
            topics: Topics::default(),
            provider: HttpProviderConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string; missing keys keep defaults
    ///
    /// # Errors
    /// Returns an error if the TOML is invalid
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `AUTONOMIC_*` overrides from the process environment
    ///
    /// # Errors
    /// Returns `ConfigError::Env` for a value that does not parse
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`
    ///
    /// # Errors
    /// Returns `ConfigError::Env` for a value that does not parse
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env { var, value })
        }

        if let Some(v) = lookup("AUTONOMIC_MAX_ATTEMPTS") {
            self.max_attempts = number("AUTONOMIC_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("AUTONOMIC_PROVIDER_TIMEOUT_MS") {
            self.provider_timeout_ms = number("AUTONOMIC_PROVIDER_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("AUTONOMIC_MAX_DELIVERIES") {
            self.max_deliveries = number("AUTONOMIC_MAX_DELIVERIES", v)?;
        }
        if let Some(v) = lookup("AUTONOMIC_TOPIC_AUDIT") {
            self.topics.audit = v;
        }
        if let Some(v) = lookup("AUTONOMIC_TOPIC_REFINE") {
            self.topics.refine = v;
        }
        if let Some(v) = lookup("AUTONOMIC_TOPIC_EVALUATE") {
            self.topics.evaluate = v;
        }
        if let Some(v) = lookup("AUTONOMIC_PROVIDER_ENDPOINT") {
            self.provider.endpoint = v;
        }
        Ok(self)
    }

    /// Reject settings the loop cannot run with
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` naming the first bad setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation("max_attempts must be at least 1".into()));
        }
        if self.max_deliveries == 0 {
            return Err(ConfigError::Validation("max_deliveries must be at least 1".into()));
        }
        if self.provider_timeout_ms == 0 {
            return Err(ConfigError::Validation("provider_timeout_ms must be positive".into()));
        }
        if self.lease_ms == 0 {
            return Err(ConfigError::Validation("lease_ms must be positive".into()));
        }
        if self.workers_per_stage == 0 {
            return Err(ConfigError::Validation("workers_per_stage must be at least 1".into()));
        }
        let topics = [&self.topics.audit, &self.topics.refine, &self.topics.evaluate];
        if topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Validation("topic names must not be empty".into()));
        }
        if topics[0] == topics[1] || topics[1] == topics[2] || topics[0] == topics[2] {
            return Err(ConfigError::Validation("each stage needs its own topic".into()));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}
