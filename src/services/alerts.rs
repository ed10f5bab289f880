use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::usage_counters::ensure_user;
use crate::{
    config::AlertsConfig,
    db::DbPool,
    error::{MeterError, MeterResult},
    models::{AlertKind, NewUsageAlert, SubscriptionPlan, UsageAlert, UsageSummary},
    observability::metrics,
};

/// Threshold alerts raised after usage is recorded.
#[derive(Clone)]
pub struct AlertService {
    db: Arc<DbPool>,
    config: AlertsConfig,
}

impl AlertService {
    pub fn new(db: Arc<DbPool>, config: AlertsConfig) -> Self {
        Self { db, config }
    }

    fn kind_for(&self, percent_used: u32) -> Option<AlertKind> {
        if percent_used >= self.config.exceeded_threshold_percent {
            Some(AlertKind::Exceeded)
        } else if percent_used >= self.config.warning_threshold_percent {
            Some(AlertKind::Warning)
        } else {
            None
        }
    }

    /// Compare a summary with the plan's limits, escalate its status and
    /// write an alert for every threshold crossed for the first time.
    ///
    /// Returns the alerts written by this call.
    pub async fn evaluate(
        &self,
        summary: &UsageSummary,
        plan: &SubscriptionPlan,
        now: DateTime<Utc>,
    ) -> MeterResult<Vec<UsageAlert>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let mut crossings: Vec<(Option<String>, u32, String)> = Vec::new();
        for usage in &summary.providers {
            let calls = plan.calls_limit(&usage.provider);
            let tokens = plan.tokens_limit(&usage.provider);
            let highest = [
                (calls, usage.calls, "calls"),
                (tokens, usage.tokens, "tokens"),
            ]
            .into_iter()
            .filter_map(|(limit, used, metric)| {
                limit.percent_used(used).map(|percent| (percent, metric, limit))
            })
            .max_by_key(|(percent, _, _)| *percent);

            if let Some((percent, metric, limit)) = highest {
                crossings.push((
                    Some(usage.provider.clone()),
                    percent,
                    format!(
                        "{} {} usage is at {}% of the {} limit of plan '{}'",
                        usage.provider, metric, percent, limit, plan.name
                    ),
                ));
            }
        }
        if let Some(percent) = plan.monthly_cost_ceiling.percent_used(summary.total_cost_microcents)
        {
            crossings.push((
                None,
                percent,
                format!(
                    "Spend is at {}% of the monthly cost ceiling of plan '{}'",
                    percent, plan.name
                ),
            ));
        }

        let mut written = Vec::new();
        for (provider, percent_used, message) in crossings {
            let Some(kind) = self.kind_for(percent_used) else {
                continue;
            };

            self.db
                .usage()
                .escalate_status(&summary.user_id, summary.billing_period, kind.status())
                .await?;

            let alert = self
                .db
                .alerts()
                .create(NewUsageAlert {
                    user_id: summary.user_id.clone(),
                    billing_period: summary.billing_period,
                    provider: provider.clone(),
                    kind,
                    percent_used,
                    message,
                    created_at: now,
                })
                .await?;

            if let Some(alert) = alert {
                metrics::record_alert(kind.as_str());
                tracing::info!(
                    user_id = %alert.user_id,
                    period = %alert.billing_period,
                    provider = provider.as_deref().unwrap_or("cost"),
                    kind = kind.as_str(),
                    percent_used,
                    "Usage alert raised"
                );
                written.push(alert);
            }
        }
        Ok(written)
    }

    pub async fn list(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> MeterResult<Vec<UsageAlert>> {
        ensure_user(user_id)?;
        Ok(self
            .db
            .alerts()
            .list_by_user(user_id, unread_only, limit.clamp(1, 1000))
            .await?)
    }

    pub async fn count_unread(&self, user_id: &str) -> MeterResult<i64> {
        Ok(self.db.alerts().count_unread(user_id).await?)
    }

    /// Mark an alert read on behalf of `user_id`, who must own it.
    pub async fn mark_read(&self, user_id: &str, alert_id: Uuid) -> MeterResult<UsageAlert> {
        ensure_user(user_id)?;
        let alert = self
            .db
            .alerts()
            .get(alert_id)
            .await?
            .ok_or_else(|| MeterError::NotFound(format!("Alert '{alert_id}' not found")))?;
        if alert.user_id != user_id {
            tracing::warn!(
                user_id = %user_id,
                alert_id = %alert_id,
                "Attempt to mark another user's alert read"
            );
            return Err(MeterError::Authorization(
                "Alert belongs to another user".to_string(),
            ));
        }

        self.db.alerts().mark_read(alert_id).await?;
        Ok(UsageAlert {
            is_read: true,
            ..alert
        })
    }
}
