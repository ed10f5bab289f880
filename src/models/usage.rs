use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BillingPeriod;
use crate::pricing::CostModel;

/// Usage state of a billing period relative to the plan limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    #[default]
    Active,
    Warning,
    Exceeded,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Active => "active",
            UsageStatus::Warning => "warning",
            UsageStatus::Exceeded => "exceeded",
        }
    }

    /// Escalation order; status only ever moves up within a period.
    pub fn rank(&self) -> i64 {
        match self {
            UsageStatus::Active => 0,
            UsageStatus::Warning => 1,
            UsageStatus::Exceeded => 2,
        }
    }
}

impl std::fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UsageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UsageStatus::Active),
            "warning" => Ok(UsageStatus::Warning),
            "exceeded" => Ok(UsageStatus::Exceeded),
            _ => Err(format!("Invalid usage status: {}", s)),
        }
    }
}

/// Counters for one provider within a billing period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub calls: i64,
    pub tokens: i64,
    /// Cost in microcents (1/1,000,000 of a dollar)
    pub cost_microcents: i64,
}

/// Usage of one user for one billing period.
///
/// Exactly one summary exists per (user, billing period).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub billing_period: BillingPeriod,
    /// Per-provider counters, sorted by provider name.
    pub providers: Vec<ProviderUsage>,
    pub total_calls: i64,
    pub total_tokens: i64,
    pub total_cost_microcents: i64,
    pub status: UsageStatus,
    /// Last time a counter changed. `None` for a summary that was never written.
    pub updated_at: Option<DateTime<Utc>>,
}

impl UsageSummary {
    /// Zero-valued summary for a period with no recorded usage.
    pub fn empty(user_id: &str, billing_period: BillingPeriod) -> Self {
        Self {
            user_id: user_id.to_string(),
            billing_period,
            providers: Vec::new(),
            total_calls: 0,
            total_tokens: 0,
            total_cost_microcents: 0,
            status: UsageStatus::Active,
            updated_at: None,
        }
    }

    pub fn provider(&self, provider: &str) -> Option<&ProviderUsage> {
        self.providers.iter().find(|p| p.provider == provider)
    }

    /// Calls and tokens used so far for `provider`, zero when none.
    pub fn provider_totals(&self, provider: &str) -> (i64, i64) {
        self.provider(provider)
            .map(|p| (p.calls, p.tokens))
            .unwrap_or((0, 0))
    }

    pub fn is_zero(&self) -> bool {
        self.total_calls == 0 && self.total_tokens == 0 && self.total_cost_microcents == 0
    }
}

/// Counter deltas applied by a single increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageDelta {
    pub provider: String,
    pub calls: i64,
    pub tokens: i64,
    pub cost_microcents: i64,
}

impl UsageDelta {
    pub fn new(provider: impl Into<String>, calls: i64, tokens: i64, cost_microcents: i64) -> Self {
        Self {
            provider: provider.into(),
            calls,
            tokens,
            cost_microcents,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.calls < 0 || self.tokens < 0 || self.cost_microcents < 0
    }
}

/// An operation a caller is about to perform, checked before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub provider: String,
    /// Model used for the pricing record lookup.
    #[serde(default)]
    pub model: Option<String>,
    /// Cost model; the provider's default applies when unset.
    #[serde(default)]
    pub cost_model: Option<CostModel>,
    #[serde(default = "default_calls")]
    pub calls: i64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub characters: i64,
}

fn default_calls() -> i64 {
    1
}

impl PendingOperation {
    /// `count` flat-priced calls.
    pub fn calls(provider: impl Into<String>, count: i64) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            cost_model: None,
            calls: count,
            input_tokens: 0,
            characters: 0,
        }
    }

    /// One call consuming `input_tokens` tokens.
    pub fn tokens(provider: impl Into<String>, input_tokens: i64) -> Self {
        Self {
            input_tokens,
            ..Self::calls(provider, 1)
        }
    }

    /// One call synthesizing `characters` characters.
    pub fn characters(provider: impl Into<String>, characters: i64) -> Self {
        Self {
            characters,
            ..Self::calls(provider, 1)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Actual usage reported by a caller after an external call completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Endpoint or feature that made the call.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub calls: i64,
    pub tokens: i64,
    /// Cost in microcents
    pub cost_microcents: i64,
    /// HTTP status returned by the provider
    #[serde(default)]
    pub status_code: Option<i32>,
    #[serde(default)]
    pub retry_count: i32,
}

impl UsageReport {
    pub fn new(
        provider: impl Into<String>,
        calls: i64,
        tokens: i64,
        cost_microcents: i64,
        status_code: Option<i32>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            endpoint: None,
            calls,
            tokens,
            cost_microcents,
            status_code,
            retry_count: 0,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn delta(&self) -> UsageDelta {
        UsageDelta::new(
            self.provider.clone(),
            self.calls,
            self.tokens,
            self.cost_microcents,
        )
    }
}
