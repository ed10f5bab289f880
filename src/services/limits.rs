use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{BillingPeriodManager, UsageCounterStore, usage_counters::ensure_user};
use crate::{
    error::{MeterError, MeterResult},
    models::{PendingOperation, UsageLimit},
    observability::metrics,
    pricing::{CostEstimate, PricingConfig},
};

/// Which quota a denied check ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMetric {
    Calls,
    Tokens,
    Cost,
    /// The subscription expired; no usage is allowed.
    Subscription,
}

/// The limit that denied a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitDetails {
    /// `None` for limits not tied to a provider.
    pub provider: Option<String>,
    pub metric: LimitMetric,
    /// Usage in the current period, including earlier operations of the batch.
    pub current: i64,
    pub requested: i64,
    pub limit: UsageLimit,
    /// `max(0, limit - current)`; `None` when the limit is unlimited.
    pub remaining: Option<i64>,
}

/// Outcome of a preflight check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub allowed: bool,
    pub message: String,
    pub details: Option<LimitDetails>,
    /// Estimated cost of every operation checked before the decision.
    pub estimated_cost_microcents: i64,
}

impl LimitCheck {
    fn allowed(estimated_cost_microcents: i64) -> Self {
        Self {
            allowed: true,
            message: "All operations are within plan limits".to_string(),
            details: None,
            estimated_cost_microcents,
        }
    }

    fn denied(message: String, details: LimitDetails, estimated_cost_microcents: i64) -> Self {
        Self {
            allowed: false,
            message,
            details: Some(details),
            estimated_cost_microcents,
        }
    }
}

/// Usage already claimed by earlier operations of the same batch.
#[derive(Default)]
struct Pending {
    calls: HashMap<String, i64>,
    tokens: HashMap<String, i64>,
    cost: i64,
}

/// Preflight checks of pending operations against plan limits.
///
/// Checks never record usage; callers report actual usage after the
/// operation ran.
#[derive(Clone)]
pub struct LimitEnforcer {
    periods: BillingPeriodManager,
    counters: UsageCounterStore,
    pricing: Arc<PricingConfig>,
}

impl LimitEnforcer {
    pub fn new(
        periods: BillingPeriodManager,
        counters: UsageCounterStore,
        pricing: Arc<PricingConfig>,
    ) -> Self {
        Self {
            periods,
            counters,
            pricing,
        }
    }

    /// Check a batch of operations in order. The first operation that would
    /// exceed a limit denies the whole batch.
    pub async fn check(
        &self,
        user_id: &str,
        operations: &[PendingOperation],
        now: DateTime<Utc>,
    ) -> MeterResult<LimitCheck> {
        ensure_user(user_id)?;
        for operation in operations {
            self.counters.ensure_known_provider(&operation.provider)?;
            if operation.calls < 0 || operation.input_tokens < 0 || operation.characters < 0 {
                return Err(MeterError::Validation(format!(
                    "Operation quantities for '{}' cannot be negative",
                    operation.provider
                )));
            }
        }

        let resolved = self.periods.resolve_subscription(user_id, now).await?;
        if resolved.is_expired() {
            let check = LimitCheck::denied(
                format!("Subscription to plan '{}' has expired", resolved.plan.name),
                LimitDetails {
                    provider: None,
                    metric: LimitMetric::Subscription,
                    current: 0,
                    requested: 0,
                    limit: UsageLimit::Capped(0),
                    remaining: Some(0),
                },
                0,
            );
            metrics::record_limit_check(false, None);
            return Ok(check);
        }

        let plan = &resolved.plan;
        let summary = self.counters.stats(user_id, None, now).await?;
        let mut pending = Pending::default();

        for operation in operations {
            let provider = operation.provider.as_str();
            let estimate = self.estimate_cost(operation)?;
            let (used_calls, used_tokens) = summary.provider_totals(provider);
            let current_calls = used_calls + pending.calls.get(provider).copied().unwrap_or(0);
            let current_tokens = used_tokens + pending.tokens.get(provider).copied().unwrap_or(0);
            let current_cost = summary.total_cost_microcents + pending.cost;

            let checks = [
                (LimitMetric::Calls, plan.calls_limit(provider), current_calls, operation.calls),
                (
                    LimitMetric::Tokens,
                    plan.tokens_limit(provider),
                    current_tokens,
                    operation.input_tokens,
                ),
                (
                    LimitMetric::Cost,
                    plan.monthly_cost_ceiling,
                    current_cost,
                    estimate.microcents,
                ),
            ];
            for (metric, limit, current, requested) in checks {
                if limit.allows(current, requested) {
                    continue;
                }

                let message = match metric {
                    LimitMetric::Cost => format!(
                        "Monthly cost ceiling of plan '{}' reached ({} of {} microcents)",
                        plan.name, current, limit
                    ),
                    _ => format!(
                        "{} {} limit of plan '{}' reached ({} of {})",
                        provider,
                        metric_name(metric),
                        plan.name,
                        current,
                        limit
                    ),
                };
                tracing::debug!(
                    user_id = %user_id,
                    provider = %provider,
                    metric = metric_name(metric),
                    current,
                    requested,
                    limit = %limit,
                    "Preflight check denied"
                );
                metrics::record_limit_check(false, Some(provider));
                return Ok(LimitCheck::denied(
                    message,
                    LimitDetails {
                        provider: (metric != LimitMetric::Cost).then(|| provider.to_string()),
                        metric,
                        current,
                        requested,
                        limit,
                        remaining: limit.remaining(current),
                    },
                    pending.cost,
                ));
            }

            *pending.calls.entry(provider.to_string()).or_default() += operation.calls;
            *pending.tokens.entry(provider.to_string()).or_default() += operation.input_tokens;
            pending.cost = pending.cost.saturating_add(estimate.microcents);
        }

        metrics::record_limit_check(true, None);
        Ok(LimitCheck::allowed(pending.cost))
    }

    /// Estimated cost of one operation.
    pub fn estimate_cost(&self, operation: &PendingOperation) -> MeterResult<CostEstimate> {
        let estimate = self.pricing.estimate(operation)?;
        metrics::record_cost_estimate(estimate.cost_model.as_str(), estimate.source.as_str());
        Ok(estimate)
    }
}

fn metric_name(metric: LimitMetric) -> &'static str {
    match metric {
        LimitMetric::Calls => "calls",
        LimitMetric::Tokens => "tokens",
        LimitMetric::Cost => "cost",
        LimitMetric::Subscription => "subscription",
    }
}
