//! Pricing records and cost estimation.
//!
//! Costs are stored in microcents (1/1,000,000 of a dollar) so very small
//! per-token and per-character prices stay exact integers.
//!
//! ```toml
//! [pricing.openai]
//! cost_model = "per_input_token"
//! default_per_1m_input_tokens = 2_500_000
//!
//! [pricing.openai.models.gpt-4o-mini]
//! input_per_1m_tokens = 150_000
//!
//! [pricing.elevenlabs]
//! cost_model = "per_character"
//! default_per_1m_characters = 30_000_000
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::PendingOperation;

/// How an operation is charged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum CostModel {
    /// Flat price per call.
    #[default]
    PerRequest,
    /// Price per 1M input tokens.
    PerInputToken,
    /// Price per 1M characters (speech synthesis and similar).
    PerCharacter,
}

impl CostModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostModel::PerRequest => "per_request",
            CostModel::PerInputToken => "per_input_token",
            CostModel::PerCharacter => "per_character",
        }
    }
}

/// Where the price used for an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPricingSource {
    /// A (provider, model) pricing record.
    Record,
    /// The provider's default constant.
    ProviderDefault,
}

impl CostPricingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostPricingSource::Record => "record",
            CostPricingSource::ProviderDefault => "provider_default",
        }
    }
}

/// Pricing record for a specific model, in microcents.
///
/// Unset fields fall back to the provider defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ModelPricing {
    /// Cost per request in microcents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_request: Option<i64>,

    /// Cost per 1M input tokens in microcents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_per_1m_tokens: Option<i64>,

    /// Cost per 1M output tokens in microcents. Informational: preflight
    /// estimates only know the input size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_per_1m_tokens: Option<i64>,

    /// Cost per 1M characters in microcents.
    /// Example: $0.30/1K chars = $300/1M chars = 300_000_000 microcents/1M
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_1m_characters: Option<i64>,
}

impl ModelPricing {
    fn rate_for(&self, model: CostModel) -> Option<i64> {
        match model {
            CostModel::PerRequest => self.per_request,
            CostModel::PerInputToken => self.input_per_1m_tokens,
            CostModel::PerCharacter => self.per_1m_characters,
        }
    }

    fn rates(&self) -> [Option<i64>; 4] {
        [
            self.per_request,
            self.input_per_1m_tokens,
            self.output_per_1m_tokens,
            self.per_1m_characters,
        ]
    }
}

/// Pricing for one provider: its cost model, fallback constants and
/// per-model records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ProviderPricing {
    /// Cost model used when an operation does not name one.
    #[serde(default)]
    pub cost_model: CostModel,

    /// Fallback cost per request in microcents.
    #[serde(default)]
    pub default_per_request: i64,

    /// Fallback cost per 1M input tokens in microcents.
    #[serde(default)]
    pub default_per_1m_input_tokens: i64,

    /// Fallback cost per 1M characters in microcents.
    #[serde(default)]
    pub default_per_1m_characters: i64,

    /// Pricing records keyed by model name.
    #[serde(default)]
    pub models: HashMap<String, ModelPricing>,
}

impl ProviderPricing {
    fn default_rate(&self, model: CostModel) -> i64 {
        match model {
            CostModel::PerRequest => self.default_per_request,
            CostModel::PerInputToken => self.default_per_1m_input_tokens,
            CostModel::PerCharacter => self.default_per_1m_characters,
        }
    }
}

/// Result of a cost estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    pub microcents: i64,
    pub cost_model: CostModel,
    pub source: CostPricingSource,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Pricing configuration for all providers, keyed by provider name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(transparent)]
pub struct PricingConfig {
    pub providers: HashMap<String, ProviderPricing>,
}

impl PricingConfig {
    pub fn is_known_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Get the pricing record for a specific provider and model
    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        self.providers.get(provider)?.models.get(model)
    }

    pub fn set_pricing(&mut self, provider: &str, model: &str, pricing: ModelPricing) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .models
            .insert(model.to_string(), pricing);
    }

    /// Estimate the cost of a pending operation in microcents.
    ///
    /// The cost model is the operation's own, or the provider's when the
    /// operation does not name one. The rate comes from the (provider, model)
    /// record when it sets one, else from the provider default. Missing or
    /// negative quantities cost nothing.
    pub fn estimate(&self, operation: &PendingOperation) -> Result<CostEstimate, PricingError> {
        let provider = self
            .providers
            .get(&operation.provider)
            .ok_or_else(|| PricingError::UnknownProvider(operation.provider.clone()))?;

        let cost_model = operation.cost_model.unwrap_or(provider.cost_model);
        let record_rate = operation
            .model
            .as_deref()
            .and_then(|model| provider.models.get(model))
            .and_then(|pricing| pricing.rate_for(cost_model));

        let (rate, source) = match record_rate {
            Some(rate) => (rate, CostPricingSource::Record),
            None => (
                provider.default_rate(cost_model),
                CostPricingSource::ProviderDefault,
            ),
        };

        Ok(CostEstimate {
            microcents: compute_cost(cost_model, rate, operation),
            cost_model,
            source,
        })
    }

    /// Reject negative rates.
    pub fn validate(&self) -> Result<(), String> {
        for (name, provider) in &self.providers {
            let defaults = [
                provider.default_per_request,
                provider.default_per_1m_input_tokens,
                provider.default_per_1m_characters,
            ];
            if defaults.iter().any(|v| *v < 0) {
                return Err(format!("pricing.{name} has a negative default rate"));
            }
            for (model, pricing) in &provider.models {
                if pricing.rates().iter().flatten().any(|v| *v < 0) {
                    return Err(format!("pricing.{name}.models.{model} has a negative rate"));
                }
            }
        }
        Ok(())
    }
}

/// Compute a cost in microcents.
///
/// Uses `i128` for intermediate calculations so large quantities times large
/// rates cannot overflow; the result saturates to `i64::MAX`.
fn compute_cost(cost_model: CostModel, rate: i64, operation: &PendingOperation) -> i64 {
    let rate = rate.max(0) as i128;
    let total = match cost_model {
        CostModel::PerRequest => operation.calls.max(0) as i128 * rate,
        CostModel::PerInputToken => (operation.input_tokens.max(0) as i128 * rate) / 1_000_000,
        CostModel::PerCharacter => (operation.characters.max(0) as i128 * rate) / 1_000_000,
    };
    saturate_to_i64(total)
}

/// Convert dollars to microcents.
///
/// Examples:
/// - $1.00 = 1,000,000 microcents
/// - $0.01 = 10,000 microcents
pub fn dollars_to_microcents(dollars: f64) -> i64 {
    (dollars * 1_000_000.0).round() as i64
}

/// Convert microcents to dollars
pub fn microcents_to_dollars(microcents: i64) -> f64 {
    microcents as f64 / 1_000_000.0
}

/// Saturate an i128 value to fit in an i64
fn saturate_to_i64(value: i128) -> i64 {
    if value > i64::MAX as i128 {
        i64::MAX
    } else if value < i64::MIN as i128 {
        i64::MIN
    } else {
        value as i64
    }
}
