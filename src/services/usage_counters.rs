use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    db::DbPool,
    error::{MeterError, MeterResult},
    models::{AuditLogEntry, BillingPeriod, NewAuditLogEntry, UsageDelta, UsageSummary},
    observability::metrics,
};

/// Longest trend a caller may ask for.
pub const MAX_TREND_MONTHS: u32 = 120;

/// Per-user, per-period, per-provider usage counters.
#[derive(Clone)]
pub struct UsageCounterStore {
    db: Arc<DbPool>,
    known_providers: Arc<HashSet<String>>,
}

impl UsageCounterStore {
    pub fn new(db: Arc<DbPool>, known_providers: impl IntoIterator<Item = String>) -> Self {
        Self {
            db,
            known_providers: Arc::new(known_providers.into_iter().collect()),
        }
    }

    /// Fail with a validation error unless `provider` is configured.
    pub fn ensure_known_provider(&self, provider: &str) -> MeterResult<()> {
        if !self.known_providers.contains(provider) {
            return Err(MeterError::Validation(format!(
                "Unknown provider: {provider}"
            )));
        }
        Ok(())
    }

    /// Add usage to the user's counters for `period`.
    pub async fn increment(
        &self,
        user_id: &str,
        period: BillingPeriod,
        delta: &UsageDelta,
        at: DateTime<Utc>,
    ) -> MeterResult<UsageSummary> {
        self.validate_delta(user_id, delta)?;
        let summary = self
            .db
            .usage()
            .increment(user_id, period, delta, at)
            .await?;
        Self::observe(user_id, period, delta);
        Ok(summary)
    }

    /// Count `entry` against its user's counters and append it to the audit
    /// log. Both writes commit together or not at all.
    pub async fn record(
        &self,
        entry: NewAuditLogEntry,
    ) -> MeterResult<(UsageSummary, AuditLogEntry)> {
        let delta = UsageDelta::new(
            entry.provider.clone(),
            entry.calls,
            entry.tokens,
            entry.cost_microcents,
        );
        self.validate_delta(&entry.user_id, &delta)?;

        let (user_id, period) = (entry.user_id.clone(), entry.billing_period);
        let recorded = self.db.usage().record(&delta, entry).await?;
        Self::observe(&user_id, period, &delta);
        Ok(recorded)
    }

    /// Reject empty users, unknown providers and negative deltas.
    pub fn validate_delta(&self, user_id: &str, delta: &UsageDelta) -> MeterResult<()> {
        ensure_user(user_id)?;
        self.ensure_known_provider(&delta.provider)?;
        if delta.is_negative() {
            return Err(MeterError::Validation(
                "Usage deltas cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    fn observe(user_id: &str, period: BillingPeriod, delta: &UsageDelta) {
        metrics::record_usage_increment(
            &delta.provider,
            delta.calls,
            delta.tokens,
            delta.cost_microcents,
        );
        tracing::debug!(
            user_id = %user_id,
            period = %period,
            provider = %delta.provider,
            calls = delta.calls,
            tokens = delta.tokens,
            cost_microcents = delta.cost_microcents,
            "Incremented usage counters"
        );
    }

    /// Summary for `period`, or for the period containing `now`.
    ///
    /// A period without usage yields a zeroed summary, which is created on
    /// the way so later increments and resets find it.
    pub async fn stats(
        &self,
        user_id: &str,
        period: Option<BillingPeriod>,
        now: DateTime<Utc>,
    ) -> MeterResult<UsageSummary> {
        ensure_user(user_id)?;
        let period = period.unwrap_or_else(|| BillingPeriod::containing(now));
        Ok(self.db.usage().get_or_create(user_id, period, now).await?)
    }

    /// Zero the counters of a period. Returns false when nothing was stored.
    pub async fn reset(
        &self,
        user_id: &str,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> MeterResult<bool> {
        ensure_user(user_id)?;
        let reset = self.db.usage().reset(user_id, period, now).await?;
        if reset {
            tracing::info!(user_id = %user_id, period = %period, "Reset usage counters");
        }
        Ok(reset)
    }

    /// One summary per month for the `months` months ending with the period
    /// containing `now`, oldest first. Months without usage are zero-filled.
    pub async fn trend(
        &self,
        user_id: &str,
        months: u32,
        now: DateTime<Utc>,
    ) -> MeterResult<Vec<UsageSummary>> {
        ensure_user(user_id)?;
        if months == 0 || months > MAX_TREND_MONTHS {
            return Err(MeterError::Validation(format!(
                "months must be between 1 and {MAX_TREND_MONTHS}"
            )));
        }

        let periods = BillingPeriod::containing(now).trailing(months);
        let (Some(&from), Some(&to)) = (periods.first(), periods.last()) else {
            return Ok(Vec::new());
        };

        let mut stored = self
            .db
            .usage()
            .list_range(user_id, from, to)
            .await?
            .into_iter()
            .peekable();

        let mut trend = Vec::with_capacity(periods.len());
        for period in periods {
            match stored.next_if(|s| s.billing_period == period) {
                Some(summary) => trend.push(summary),
                None => trend.push(UsageSummary::empty(user_id, period)),
            }
        }
        Ok(trend)
    }
}

pub(crate) fn ensure_user(user_id: &str) -> MeterResult<()> {
    if user_id.trim().is_empty() {
        return Err(MeterError::Validation("user id cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::db::tests::harness::{create_sqlite_pool, run_sqlite_migrations, test_now};

    async fn store() -> UsageCounterStore {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        UsageCounterStore::new(
            Arc::new(DbPool::from_sqlite(pool)),
            ["openai".to_string(), "elevenlabs".to_string()],
        )
    }

    fn march() -> BillingPeriod {
        BillingPeriod::new(2026, 3).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let store = store().await;
        let err = store
            .increment("user-1", march(), &UsageDelta::new("nope", 1, 0, 0), test_now())
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_negative_delta_rejected() {
        let store = store().await;
        let err = store
            .increment("user-1", march(), &UsageDelta::new("openai", -1, 0, 0), test_now())
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stats_defaults_to_current_period() {
        let store = store().await;
        store
            .increment("user-1", march(), &UsageDelta::new("openai", 2, 10, 3), test_now())
            .await
            .unwrap();

        let current = store.stats("user-1", None, test_now()).await.unwrap();
        assert_eq!(current.billing_period, march());
        assert_eq!(current.total_calls, 2);

        let empty = store
            .stats("user-1", Some(BillingPeriod::new(2025, 1).unwrap()), test_now())
            .await
            .unwrap();
        assert!(empty.is_zero());
    }

    #[tokio::test]
    async fn test_trend_zero_fills_in_order() {
        let store = store().await;
        let january = Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap();
        store
            .increment(
                "user-1",
                BillingPeriod::containing(january),
                &UsageDelta::new("openai", 4, 0, 0),
                january,
            )
            .await
            .unwrap();
        store
            .increment("user-1", march(), &UsageDelta::new("openai", 1, 0, 0), test_now())
            .await
            .unwrap();

        let trend = store.trend("user-1", 4, test_now()).await.unwrap();
        let periods: Vec<String> = trend.iter().map(|s| s.billing_period.to_string()).collect();
        assert_eq!(periods, ["2025-12", "2026-01", "2026-02", "2026-03"]);
        let calls: Vec<i64> = trend.iter().map(|s| s.total_calls).collect();
        assert_eq!(calls, [0, 4, 0, 1]);
    }

    #[tokio::test]
    async fn test_trend_rejects_zero_months() {
        let store = store().await;
        assert!(matches!(
            store.trend("user-1", 0, test_now()).await,
            Err(MeterError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_then_increment() {
        let store = store().await;
        let now = test_now();
        store
            .increment("user-1", march(), &UsageDelta::new("openai", 5, 50, 5), now)
            .await
            .unwrap();

        assert!(store.reset("user-1", march(), now).await.unwrap());
        let summary = store
            .increment(
                "user-1",
                march(),
                &UsageDelta::new("openai", 1, 1, 1),
                now + Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(summary.total_calls, 1);
    }

    #[tokio::test]
    async fn test_record_counts_and_logs_together() {
        let store = store().await;
        let entry = NewAuditLogEntry {
            user_id: "user-1".to_string(),
            occurred_at: test_now(),
            provider: "openai".to_string(),
            model: None,
            endpoint: "chat".to_string(),
            calls: 2,
            tokens: 40,
            cost_microcents: 7,
            status_code: Some(200),
            retry_count: 0,
            billing_period: march(),
        };

        let (summary, logged) = store.record(entry.clone()).await.unwrap();
        assert_eq!(summary.total_calls, 2);
        assert_eq!(logged.calls, 2);
        assert_eq!(store.db.audit_logs().count_raw("user-1").await.unwrap(), 1);

        let unknown = NewAuditLogEntry {
            provider: "nope".to_string(),
            ..entry
        };
        assert!(matches!(
            store.record(unknown).await,
            Err(MeterError::Validation(_))
        ));
        assert_eq!(store.db.audit_logs().count_raw("user-1").await.unwrap(), 1);
        let stored = store.stats("user-1", Some(march()), test_now()).await.unwrap();
        assert_eq!(stored.total_calls, 2);
    }
}
