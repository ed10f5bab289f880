mod database;
mod limits;
mod observability;
mod plans;
mod retention;

use std::{collections::HashSet, path::Path};

pub use database::*;
pub use limits::*;
pub use observability::*;
pub use plans::*;
use regex::Regex;
pub use retention::*;
use serde::{Deserialize, Serialize};

pub use crate::pricing::PricingConfig;

/// Root configuration for the metering engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Subscription plan catalog.
    #[serde(default)]
    pub plans: PlansConfig,

    /// Pricing records by provider and model.
    /// The configured providers are the only providers the engine accepts.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Usage alert thresholds.
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Audit-log compaction.
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Renewal-history retention tiers.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Request rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Dashboard response cache.
    #[serde(default)]
    pub response_cache: ResponseCacheConfig,

    /// Renewal event channel.
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl MeterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: MeterConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.pricing.validate().map_err(ConfigError::Validation)?;
        self.plans.validate(&self.known_providers())?;
        self.alerts.validate()?;
        self.compaction.validate()?;
        self.retention.validate()?;
        self.rate_limit.validate()?;
        self.response_cache.validate()?;
        self.events.validate()?;
        self.observability.validate()?;
        Ok(())
    }

    /// Providers the engine accepts usage for.
    pub fn known_providers(&self) -> HashSet<&str> {
        self.pricing.providers.keys().map(String::as_str).collect()
    }

    /// Generate the JSON schema for the configuration file.
    #[cfg(feature = "json-schema")]
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MeterConfig)
    }

    /// Generate the JSON schema as a pretty-printed JSON string.
    #[cfg(feature = "json-schema")]
    pub fn json_schema_string() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::json_schema())
    }
}

/// Renewal event channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Events buffered per receiver before slow receivers start lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl EventsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "events.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_channel_capacity() -> usize {
    256
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR}` references from the environment.
///
/// References after a `#` on the same line are left alone so commented-out
/// settings never require their variables to be set.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("env var pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };
            if comment_pos.is_some_and(|pos| whole.start() >= pos) {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
