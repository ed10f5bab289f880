//! Prometheus metrics for the metering engine.
//!
//! Provides metrics for:
//! - Recorded usage (calls, tokens, cost)
//! - Limit checks and cost estimates
//! - Period rollovers and maintenance sweeps
//! - Rate limiting and the dashboard cache

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle used to render the exposition text.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_tokens".to_string()),
            &config.token_buckets,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_rows".to_string()),
            &config.row_buckets,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

/// Render the current metrics in Prometheus text format.
///
/// Returns `None` when metrics were never initialized.
pub fn render_metrics() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a counter increment applied to a usage summary.
pub fn record_usage_increment(provider: &str, calls: i64, tokens: i64, cost_microcents: i64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("meter_usage_calls_total", "provider" => provider.to_string())
            .increment(calls.max(0) as u64);
        counter!("meter_usage_cost_microcents_total", "provider" => provider.to_string())
            .increment(cost_microcents.max(0) as u64);
        histogram!("meter_usage_tokens", "provider" => provider.to_string()).record(tokens as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (provider, calls, tokens, cost_microcents);
    }
}

/// Record a pre-flight limit check.
pub fn record_limit_check(allowed: bool, provider: Option<&str>) {
    #[cfg(feature = "prometheus")]
    {
        let result = if allowed { "allowed" } else { "denied" };
        // "*" marks denials that are not tied to a provider (cost ceiling, expiry)
        counter!(
            "meter_limit_checks_total",
            "result" => result,
            "provider" => provider.unwrap_or("*").to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (allowed, provider);
    }
}

/// Record a cost estimate and where its price came from.
pub fn record_cost_estimate(cost_model: &str, source: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "meter_cost_estimates_total",
            "cost_model" => cost_model.to_string(),
            "source" => source.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (cost_model, source);
    }
}

/// Record an audit-log compaction run.
pub fn record_compaction(rows_folded: i64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("meter_compactions_total").increment(1);
        histogram!("meter_compaction_rows").record(rows_folded as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = rows_folded;
    }
}

/// Record a renewal record moving between retention tiers.
pub fn record_retention_transition(from: &str, to: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "meter_retention_transitions_total",
            "from" => from.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (from, to);
    }
}

/// Record the outcome of a period rollover ("renewed", "expired", "lost_race").
pub fn record_period_rollover(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("meter_period_rollovers_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Record a rate limit decision.
pub fn record_rate_limit(action: &str, allowed: bool) {
    #[cfg(feature = "prometheus")]
    {
        let result = if allowed { "allowed" } else { "limited" };
        counter!(
            "meter_rate_limit_checks_total",
            "action" => action.to_string(),
            "result" => result
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (action, allowed);
    }
}

/// Record a dashboard cache operation ("hit", "miss", "invalidate").
pub fn record_cache(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("meter_cache_operations_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Record a usage alert being written.
pub fn record_alert(kind: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("meter_alerts_total", "kind" => kind.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = kind;
    }
}

/// Record a renewal event broadcast and how many receivers saw it.
pub fn record_renewal_event(renewal_type: &str, receivers: usize) {
    #[cfg(feature = "prometheus")]
    {
        counter!("meter_renewal_events_total", "renewal_type" => renewal_type.to_string())
            .increment(1);
        if receivers == 0 {
            counter!("meter_renewal_events_unobserved_total").increment(1);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (renewal_type, receivers);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
