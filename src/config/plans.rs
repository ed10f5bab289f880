//! Subscription plan catalog.
//!
//! Plans are declared in config and synchronized into the database at
//! startup so subscriptions can reference them by id.
//!
//! ```toml
//! [plans]
//! free_plan_id = "free"
//!
//! [[plans.tiers]]
//! id = "free"
//! name = "Free"
//! tier_rank = 0
//!
//! [plans.tiers.limits.openai]
//! max_calls = 10
//!
//! [[plans.tiers]]
//! id = "pro"
//! name = "Pro"
//! tier_rank = 10
//! monthly_cost_ceiling_microcents = 50_000_000
//!
//! [plans.tiers.limits.openai]
//! max_calls = 0          # unlimited
//! max_tokens = 2_000_000
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::{ProviderLimit, SubscriptionPlan, UsageLimit};

/// Calls per provider granted by the built-in free plan.
pub const BUILTIN_FREE_CALLS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct PlansConfig {
    /// Plan synthesized for users without a stored subscription.
    #[serde(default = "default_free_plan_id")]
    pub free_plan_id: String,

    /// Plan definitions.
    #[serde(default)]
    pub tiers: Vec<PlanConfig>,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            free_plan_id: default_free_plan_id(),
            tiers: Vec::new(),
        }
    }
}

impl PlansConfig {
    pub fn get(&self, plan_id: &str) -> Option<&PlanConfig> {
        self.tiers.iter().find(|p| p.id == plan_id)
    }

    /// The free plan, either as configured or the built-in default that
    /// allows [`BUILTIN_FREE_CALLS`] calls per known provider.
    pub fn free_plan<'a>(&self, known_providers: impl IntoIterator<Item = &'a String>) -> SubscriptionPlan {
        match self.get(&self.free_plan_id) {
            Some(plan) => plan.to_plan(),
            None => {
                let mut limits: Vec<ProviderLimit> = known_providers
                    .into_iter()
                    .map(|provider| ProviderLimit {
                        provider: provider.clone(),
                        max_calls: UsageLimit::Capped(BUILTIN_FREE_CALLS),
                        max_tokens: UsageLimit::Unlimited,
                    })
                    .collect();
                limits.sort_by(|a, b| a.provider.cmp(&b.provider));
                SubscriptionPlan {
                    id: self.free_plan_id.clone(),
                    name: "Free".to_string(),
                    tier_rank: 0,
                    monthly_cost_ceiling: UsageLimit::Unlimited,
                    limits,
                }
            }
        }
    }

    pub fn validate(&self, known_providers: &HashSet<&str>) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for plan in &self.tiers {
            if plan.id.trim().is_empty() {
                return Err(ConfigError::Validation("plan id cannot be empty".into()));
            }
            if !seen.insert(plan.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate plan id '{}'",
                    plan.id
                )));
            }
            for (provider, limit) in &plan.limits {
                if !known_providers.contains(provider.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "plan '{}' sets limits for unknown provider '{}'",
                        plan.id, provider
                    )));
                }
                if limit.max_calls.is_some_and(|v| v < 0) || limit.max_tokens.is_some_and(|v| v < 0)
                {
                    return Err(ConfigError::Validation(format!(
                        "plan '{}' has a negative limit for provider '{}'",
                        plan.id, provider
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_free_plan_id() -> String {
    "free".to_string()
}

/// A single plan definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    pub id: String,
    pub name: String,

    /// Ordinal rank used to classify plan changes as upgrades or downgrades.
    #[serde(default)]
    pub tier_rank: i32,

    /// Monthly cost ceiling in microcents. Omitted or 0 means unlimited.
    #[serde(default)]
    pub monthly_cost_ceiling_microcents: Option<i64>,

    /// Limits keyed by provider. Providers without an entry are unlimited.
    #[serde(default)]
    pub limits: HashMap<String, ProviderLimitConfig>,
}

impl PlanConfig {
    pub fn to_plan(&self) -> SubscriptionPlan {
        let mut limits: Vec<ProviderLimit> = self
            .limits
            .iter()
            .map(|(provider, limit)| ProviderLimit {
                provider: provider.clone(),
                max_calls: UsageLimit::from_config(limit.max_calls),
                max_tokens: UsageLimit::from_config(limit.max_tokens),
            })
            .collect();
        limits.sort_by(|a, b| a.provider.cmp(&b.provider));

        SubscriptionPlan {
            id: self.id.clone(),
            name: self.name.clone(),
            tier_rank: self.tier_rank,
            monthly_cost_ceiling: UsageLimit::from_config(self.monthly_cost_ceiling_microcents),
            limits,
        }
    }
}

/// Per-provider limits. Omitted or 0 means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ProviderLimitConfig {
    #[serde(default)]
    pub max_calls: Option<i64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_free_plan_limits_every_known_provider() {
        let config = PlansConfig::default();
        let providers = vec!["openai".to_string(), "elevenlabs".to_string()];
        let plan = config.free_plan(&providers);

        assert_eq!(plan.id, "free");
        assert_eq!(plan.tier_rank, 0);
        assert_eq!(plan.limits.len(), 2);
        assert_eq!(plan.limits[0].provider, "elevenlabs");
        assert_eq!(plan.limits[0].max_calls, UsageLimit::Capped(10));
        assert_eq!(plan.limits[0].max_tokens, UsageLimit::Unlimited);
    }

    #[test]
    fn test_configured_free_plan_wins() {
        let mut config = PlansConfig::default();
        config.tiers.push(PlanConfig {
            id: "free".into(),
            name: "Starter".into(),
            tier_rank: 0,
            monthly_cost_ceiling_microcents: None,
            limits: HashMap::from([(
                "openai".to_string(),
                ProviderLimitConfig {
                    max_calls: Some(3),
                    max_tokens: Some(0),
                },
            )]),
        });

        let plan = config.free_plan(&Vec::new());
        assert_eq!(plan.name, "Starter");
        assert_eq!(plan.limits[0].max_calls, UsageLimit::Capped(3));
        assert_eq!(plan.limits[0].max_tokens, UsageLimit::Unlimited);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = PlansConfig::default();
        config.tiers.push(PlanConfig {
            id: "pro".into(),
            name: "Pro".into(),
            tier_rank: 1,
            monthly_cost_ceiling_microcents: None,
            limits: HashMap::from([("nope".to_string(), ProviderLimitConfig::default())]),
        });

        let known = HashSet::from(["openai"]);
        assert!(config.validate(&known).is_err());
    }
}
