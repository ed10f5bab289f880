use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Usage alert thresholds.
///
/// Thresholds are percentages of the plan limit. An alert is written the first
/// time a user's usage for a period crosses each threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct AlertsConfig {
    /// Whether usage alerts are evaluated after each recorded usage.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Percentage of a limit at which the summary moves to `warning`.
    /// Default: 80
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold_percent: u32,

    /// Percentage of a limit at which the summary moves to `exceeded`.
    /// Default: 100
    #[serde(default = "default_exceeded_threshold")]
    pub exceeded_threshold_percent: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold_percent: default_warning_threshold(),
            exceeded_threshold_percent: default_exceeded_threshold(),
        }
    }
}

impl AlertsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warning_threshold_percent == 0
            || self.warning_threshold_percent >= self.exceeded_threshold_percent
        {
            return Err(ConfigError::Validation(format!(
                "alerts.warning_threshold_percent ({}) must be between 1 and \
                 alerts.exceeded_threshold_percent ({})",
                self.warning_threshold_percent, self.exceeded_threshold_percent
            )));
        }
        Ok(())
    }
}

fn default_warning_threshold() -> u32 {
    80
}

fn default_exceeded_threshold() -> u32 {
    100
}

/// Sliding-window rate limiting.
///
/// ```toml
/// [rate_limit]
/// max_requests = 60
/// window_secs = 60
///
/// [rate_limit.actions.research]
/// max_requests = 5
/// window_secs = 3600
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether requests are rate limited at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per window for actions without an override.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds for actions without an override.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Per-action overrides keyed by action name.
    #[serde(default)]
    pub actions: HashMap<String, RateLimitPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            actions: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Policy that applies to `action`.
    pub fn policy_for(&self, action: &str) -> RateLimitPolicy {
        self.actions
            .get(action)
            .cloned()
            .unwrap_or(RateLimitPolicy {
                max_requests: self.max_requests,
                window_secs: self.window_secs,
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let default = RateLimitPolicy {
            max_requests: self.max_requests,
            window_secs: self.window_secs,
        };
        default
            .validate()
            .map_err(|e| ConfigError::Validation(format!("rate_limit: {e}")))?;
        for (action, policy) in &self.actions {
            policy
                .validate()
                .map_err(|e| ConfigError::Validation(format!("rate_limit.actions.{action}: {e}")))?;
        }
        Ok(())
    }
}

/// A single rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err("max_requests must be at least 1".into());
        }
        if self.window_secs == 0 {
            return Err("window_secs must be at least 1".into());
        }
        Ok(())
    }
}

fn default_max_requests() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

/// Short-lived cache for dashboard aggregate reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ResponseCacheConfig {
    /// Whether dashboard reads are cached.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry lifetime in seconds.
    /// Default: 30
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Number of monthly summaries included in a cached dashboard.
    /// Default: 6
    #[serde(default = "default_trend_months")]
    pub trend_months: u32,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            trend_months: default_trend_months(),
        }
    }
}

impl ResponseCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trend_months == 0 {
            return Err(ConfigError::Validation(
                "response_cache.trend_months must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_trend_months() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_for_falls_back_to_default() {
        let mut config = RateLimitConfig::default();
        config.actions.insert(
            "research".to_string(),
            RateLimitPolicy {
                max_requests: 5,
                window_secs: 3600,
            },
        );

        assert_eq!(config.policy_for("research").max_requests, 5);
        assert_eq!(config.policy_for("chat").max_requests, 60);
        assert_eq!(config.policy_for("chat").window(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = RateLimitConfig {
            window_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_alert_thresholds_must_be_ordered() {
        let config = AlertsConfig {
            warning_threshold_percent: 100,
            exceeded_threshold_percent: 90,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(AlertsConfig::default().validate().is_ok());
    }
}
