//! The metering engine facade.
//!
//! [`MeterEngine`] wires the services together and is what callers (the
//! payment collaborator, content-generation workers, dashboards) talk to.
//! Each engine owns its own response cache and rate limiter; two engines in
//! one process share nothing but the database.
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!  check_limits ─>│ LimitEnforcer ──> BillingPeriodManager   │
//!  record_usage ─>│ UsageCounterStore ─> AlertService        │──> DbPool
//!  subscribe ────>│ BillingPeriodManager ─> RenewalEventBus  │
//!  dashboard ────>│ ResponseCache (read-through)             │
//!                 └──────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    cache::ResponseCache,
    config::MeterConfig,
    db::{CompactionOutcome, DbPool},
    error::{MeterError, MeterResult},
    events::{RenewalEvent, RenewalEventBus, RenewalHook},
    models::{
        BillingCycle, BillingPeriod, NewAuditLogEntry, PendingOperation, RenewalHistoryRecord,
        ResolvedSubscription, RetentionStats, SubscriptionStatus, UsageAlert, UsageReport,
        UsageSummary,
    },
    pricing::CostEstimate,
    rate_limit::{RateLimitDecision, RateLimiter},
    services::{
        AlertService, BillingPeriodManager, LimitCheck, LimitEnforcer, LogCompactor,
        RetentionRunResult, RetentionTierManager, Rollover, SubscribeRequest, SubscriptionChange,
        UsageCounterStore, ensure_user,
    },
};

/// Endpoint recorded for usage reported without one.
const UNKNOWN_ENDPOINT: &str = "unknown";

/// Upper bound on rows returned by list reads.
const MAX_LIST_LIMIT: i64 = 1000;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of [`MeterEngine::record_usage`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordedUsage {
    /// Counters of the current period after the increment.
    pub summary: UsageSummary,
    /// Alerts raised by this report.
    pub alerts: Vec<UsageAlert>,
}

/// Why [`MeterEngine::reset_current_period`] did or did not reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// The user never subscribed.
    NoSubscription,
    /// The subscription ended without auto-renew.
    SubscriptionExpired,
    /// The current period has not ended yet.
    PeriodActive,
    /// Another caller already rolled the period over.
    AlreadyRenewed,
    /// The period ended and was renewed by this call.
    PeriodRenewed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodReset {
    pub reset: bool,
    pub reason: ResetReason,
}

/// Aggregate read served through the response cache.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub current: UsageSummary,
    /// Monthly summaries, oldest first, ending with the current period.
    pub trend: Vec<UsageSummary>,
    pub unread_alerts: i64,
    pub subscription: ResolvedSubscription,
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// `None` when the audit log was below the compaction threshold.
    pub compaction: Option<CompactionOutcome>,
    pub retention: RetentionRunResult,
}

pub struct MeterEngine {
    config: MeterConfig,
    db: Arc<DbPool>,
    counters: UsageCounterStore,
    periods: BillingPeriodManager,
    limits: LimitEnforcer,
    compactor: LogCompactor,
    retention: RetentionTierManager,
    alerts: AlertService,
    events: Arc<RenewalEventBus>,
    rate_limiter: RateLimiter,
    dashboards: ResponseCache<Dashboard>,
    clock: Clock,
}

impl MeterEngine {
    /// Build an engine over a migrated database.
    ///
    /// Fails with [`MeterError::DatabaseSchema`] unless the database is at
    /// exactly the schema this build expects, then stores the configured
    /// plans so subscriptions can reference them.
    pub async fn new(db: Arc<DbPool>, config: MeterConfig) -> MeterResult<Self> {
        db.check_schema_version().await?;

        let known_providers: Vec<String> = config.pricing.providers.keys().cloned().collect();
        let free_plan = config.plans.free_plan(&known_providers);

        let now = Utc::now();
        let plans = db.plans();
        for tier in &config.plans.tiers {
            plans.upsert(&tier.to_plan(), now).await?;
        }
        if config.plans.get(&free_plan.id).is_none() {
            plans.upsert(&free_plan, now).await?;
        }

        let events = Arc::new(RenewalEventBus::with_capacity(
            config.events.channel_capacity,
        ));
        let counters = UsageCounterStore::new(db.clone(), known_providers);
        let periods = BillingPeriodManager::new(db.clone(), free_plan, events.clone());
        let limits = LimitEnforcer::new(
            periods.clone(),
            counters.clone(),
            Arc::new(config.pricing.clone()),
        );

        tracing::info!(
            plans = config.plans.tiers.len(),
            providers = config.pricing.providers.len(),
            free_plan = %periods.free_plan().id,
            "Metering engine ready"
        );

        Ok(Self {
            compactor: LogCompactor::new(db.clone(), config.compaction.clone()),
            retention: RetentionTierManager::new(db.clone(), config.retention.clone()),
            alerts: AlertService::new(db.clone(), config.alerts.clone()),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            dashboards: ResponseCache::new(&config.response_cache),
            clock: Arc::new(Utc::now),
            config,
            db,
            counters,
            periods,
            limits,
            events,
        })
    }

    /// Open the configured database, migrate it when enabled, and build an
    /// engine over it.
    pub async fn from_config(config: MeterConfig) -> MeterResult<Self> {
        let db = DbPool::from_config(&config.database).await?;
        if config.database.run_migrations {
            db.run_migrations().await?;
        }
        Self::new(Arc::new(db), config).await
    }

    /// Consult `hook` before every user-initiated subscription change.
    pub fn with_hook(mut self, hook: Arc<dyn RenewalHook>) -> Self {
        self.periods = self.periods.with_hook(hook);
        self
    }

    /// Replace the wall clock, e.g. to replay usage at a fixed instant.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Drop cached dashboards and rate-limit windows. A closed engine keeps
    /// serving, without caching.
    pub fn close(&self) {
        self.dashboards.close();
        self.rate_limiter.clear();
        let released = self.compactor.prune_locks() + self.retention.prune_locks();
        tracing::info!(released_locks = released, "Metering engine closed");
    }

    /// Preflight a batch of operations against the user's plan.
    pub async fn check_limits(
        &self,
        user_id: &str,
        operations: &[PendingOperation],
    ) -> MeterResult<LimitCheck> {
        self.limits.check(user_id, operations, self.now()).await
    }

    pub fn estimate_cost(&self, operation: &PendingOperation) -> MeterResult<CostEstimate> {
        self.limits.estimate_cost(operation)
    }

    /// Count usage of a completed external call, log it, and raise any
    /// threshold alerts it crosses.
    pub async fn record_usage(
        &self,
        user_id: &str,
        report: UsageReport,
    ) -> MeterResult<RecordedUsage> {
        self.counters.validate_delta(user_id, &report.delta())?;
        let now = self.now();
        let period = BillingPeriodManager::current_period(now);

        // Roll an ended period over first: the renewal resets the counters
        // this report is about to land in.
        let resolved = self.periods.resolve_subscription(user_id, now).await?;

        let (summary, _) = self
            .counters
            .record(NewAuditLogEntry {
                user_id: user_id.to_string(),
                occurred_at: now,
                provider: report.provider,
                model: report.model,
                endpoint: report
                    .endpoint
                    .unwrap_or_else(|| UNKNOWN_ENDPOINT.to_string()),
                calls: report.calls,
                tokens: report.tokens,
                cost_microcents: report.cost_microcents,
                status_code: report.status_code,
                retry_count: i64::from(report.retry_count),
                billing_period: period,
            })
            .await?;
        let alerts = self.alerts.evaluate(&summary, &resolved.plan, now).await?;

        self.dashboards.invalidate(user_id);
        Ok(RecordedUsage { summary, alerts })
    }

    /// Usage of `period` (`YYYY-MM`), or of the current period.
    ///
    /// Compacts the user's audit log first when it is over the threshold.
    pub async fn current_usage(
        &self,
        user_id: &str,
        period: Option<&str>,
    ) -> MeterResult<UsageSummary> {
        ensure_user(user_id)?;
        let period = period.map(str::parse::<BillingPeriod>).transpose()?;

        if self.config.compaction.sweep_on_read
            && let Err(e) = self.compactor.compact(user_id).await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Audit log compaction failed");
        }

        self.counters.stats(user_id, period, self.now()).await
    }

    /// Monthly summaries for the last `months` months, oldest first.
    pub async fn usage_trend(&self, user_id: &str, months: u32) -> MeterResult<Vec<UsageSummary>> {
        self.counters.trend(user_id, months, self.now()).await
    }

    /// Put the user on `plan_id`. `billing_cycle` is `monthly` or `yearly`.
    pub async fn subscribe(
        &self,
        user_id: &str,
        plan_id: &str,
        billing_cycle: &str,
    ) -> MeterResult<SubscriptionChange> {
        let billing_cycle: BillingCycle = billing_cycle.parse().map_err(MeterError::Validation)?;
        self.subscribe_with(user_id, SubscribeRequest::new(plan_id, billing_cycle))
            .await
    }

    pub async fn subscribe_with(
        &self,
        user_id: &str,
        request: SubscribeRequest,
    ) -> MeterResult<SubscriptionChange> {
        let change = self.periods.subscribe(user_id, request, self.now()).await?;
        self.dashboards.invalidate(user_id);
        Ok(change)
    }

    /// Roll the user's subscription over if its period has ended.
    pub async fn reset_current_period(&self, user_id: &str) -> MeterResult<PeriodReset> {
        ensure_user(user_id)?;
        let Some(subscription) = self.db.subscriptions().get_by_user(user_id).await? else {
            return Ok(PeriodReset {
                reset: false,
                reason: ResetReason::NoSubscription,
            });
        };

        let outcome = self
            .periods
            .advance_if_expired(subscription, self.now())
            .await?;
        let reason = match outcome.rollover {
            Rollover::Renewed => ResetReason::PeriodRenewed,
            Rollover::Superseded => ResetReason::AlreadyRenewed,
            Rollover::Expired => ResetReason::SubscriptionExpired,
            Rollover::Unchanged if outcome.subscription.status == SubscriptionStatus::Expired => {
                ResetReason::SubscriptionExpired
            }
            Rollover::Unchanged => ResetReason::PeriodActive,
        };

        let reset = reason == ResetReason::PeriodRenewed;
        if reset || outcome.rollover == Rollover::Expired {
            self.dashboards.invalidate(user_id);
        }
        Ok(PeriodReset { reset, reason })
    }

    /// Current usage, trend, unread alerts and subscription in one read.
    ///
    /// Served from the response cache while fresh; engine writes for the
    /// user invalidate it.
    pub async fn dashboard(&self, user_id: &str) -> MeterResult<Dashboard> {
        ensure_user(user_id)?;
        self.dashboards
            .get_or_load(user_id, || async {
                let now = self.now();
                let subscription = self.periods.resolve_subscription(user_id, now).await?;
                let current = self.counters.stats(user_id, None, now).await?;
                let trend = self
                    .counters
                    .trend(user_id, self.config.response_cache.trend_months, now)
                    .await?;
                let unread_alerts = self.alerts.count_unread(user_id).await?;
                Ok::<_, MeterError>(Dashboard {
                    current,
                    trend,
                    unread_alerts,
                    subscription,
                })
            })
            .await
    }

    pub async fn alerts(&self, user_id: &str, unread_only: bool) -> MeterResult<Vec<UsageAlert>> {
        self.alerts.list(user_id, unread_only, MAX_LIST_LIMIT).await
    }

    pub async fn mark_alert_read(&self, user_id: &str, alert_id: Uuid) -> MeterResult<UsageAlert> {
        let alert = self.alerts.mark_read(user_id, alert_id).await?;
        self.dashboards.invalidate(user_id);
        Ok(alert)
    }

    /// The user's renewal history, newest first.
    ///
    /// Moves the user's records to their retention tiers first.
    pub async fn renewal_history(
        &self,
        user_id: &str,
        limit: i64,
    ) -> MeterResult<Vec<RenewalHistoryRecord>> {
        ensure_user(user_id)?;
        if self.config.retention.sweep_on_read
            && let Err(e) = self.retention.apply(Some(user_id), self.now()).await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Retention sweep failed");
        }

        Ok(self
            .db
            .renewals()
            .list_by_user(user_id, limit.clamp(1, MAX_LIST_LIMIT))
            .await?)
    }

    /// Renewal records per retention tier, for one user or all.
    pub async fn retention_stats(&self, user_id: Option<&str>) -> MeterResult<RetentionStats> {
        self.retention.stats(user_id).await
    }

    /// Receiver for every renewal event published from now on.
    pub fn renewal_events(&self) -> broadcast::Receiver<RenewalEvent> {
        self.events.subscribe()
    }

    /// Count a request against the rate limit of `action`.
    pub fn check_rate(
        &self,
        action: &str,
        user_id: Option<&str>,
        origin: &str,
    ) -> MeterResult<RateLimitDecision> {
        Ok(self.rate_limiter.check(action, user_id, origin)?)
    }

    /// Compact the user's audit log and apply retention tiers to their
    /// renewal history.
    pub async fn sweep(&self, user_id: &str) -> MeterResult<SweepReport> {
        let compaction = self.compactor.compact(user_id).await?;
        let retention = self.retention.apply(Some(user_id), self.now()).await?;
        Ok(SweepReport {
            compaction,
            retention,
        })
    }

    /// Apply retention tiers to every user's renewal history.
    ///
    /// Also drops rate-limit windows with no recent requests.
    pub async fn sweep_retention(&self) -> MeterResult<RetentionRunResult> {
        let pruned = self.rate_limiter.cleanup();
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped idle rate-limit windows");
        }
        self.retention.apply(None, self.now()).await
    }
}
