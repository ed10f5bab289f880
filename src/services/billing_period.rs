use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::usage_counters::ensure_user;
use crate::{
    db::{DbError, DbPool, RenewalCommit},
    error::{MeterError, MeterResult},
    events::{RenewalEvent, RenewalEventBus, RenewalHook},
    models::{
        BillingCycle, BillingPeriod, NewRenewalRecord, PaymentMetadata, RenewalHistoryRecord,
        RenewalType, ResolvedSubscription, SubscriptionPlan, SubscriptionStatus, UsageSnapshot,
        UserSubscription,
    },
    observability::metrics,
};

/// What [`BillingPeriodManager::advance_if_expired`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rollover {
    /// The period has not ended, or the subscription was already expired.
    Unchanged,
    /// A new period was committed and the counters were reset.
    Renewed,
    /// The subscription ended without auto-renew.
    Expired,
    /// Another caller advanced the subscription first; the stored row is returned.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub subscription: UserSubscription,
    pub rollover: Rollover,
}

/// A user-initiated plan change.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub auto_renew: bool,
    /// Details reported by the payment collaborator, kept on the history record.
    pub payment: PaymentMetadata,
}

impl SubscribeRequest {
    pub fn new(plan_id: impl Into<String>, billing_cycle: BillingCycle) -> Self {
        Self {
            plan_id: plan_id.into(),
            billing_cycle,
            auto_renew: true,
            payment: PaymentMetadata::default(),
        }
    }
}

/// Result of a committed subscription change.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionChange {
    pub subscription: UserSubscription,
    pub plan: SubscriptionPlan,
    pub record: RenewalHistoryRecord,
}

/// Resolves subscriptions and moves them through their billing periods.
///
/// ```text
/// ACTIVE --(period over, auto_renew)---> ACTIVE (next period, counters reset)
/// ACTIVE --(period over, !auto_renew)--> EXPIRED
/// any    --(subscribe)-----------------> ACTIVE (new period, counters reset)
/// ```
#[derive(Clone)]
pub struct BillingPeriodManager {
    db: Arc<DbPool>,
    free_plan: SubscriptionPlan,
    events: Arc<RenewalEventBus>,
    hook: Option<Arc<dyn RenewalHook>>,
}

impl BillingPeriodManager {
    pub fn new(db: Arc<DbPool>, free_plan: SubscriptionPlan, events: Arc<RenewalEventBus>) -> Self {
        Self {
            db,
            free_plan,
            events,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RenewalHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn free_plan(&self) -> &SubscriptionPlan {
        &self.free_plan
    }

    /// Calendar period usage counters aggregate into. The same for every
    /// user, independent of subscription boundaries.
    pub fn current_period(now: DateTime<Utc>) -> BillingPeriod {
        BillingPeriod::containing(now)
    }

    /// Look up a plan by id. The free plan resolves even when it was never
    /// stored.
    pub async fn plan(&self, plan_id: &str) -> MeterResult<SubscriptionPlan> {
        match self.db.plans().get(plan_id).await? {
            Some(plan) => Ok(plan),
            None if plan_id == self.free_plan.id => Ok(self.free_plan.clone()),
            None => Err(MeterError::NotFound(format!("Plan '{plan_id}' not found"))),
        }
    }

    /// The user's subscription and plan, advanced past any ended period.
    ///
    /// Users who never subscribed get a synthesized, unstored free-plan
    /// subscription.
    pub async fn resolve_subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> MeterResult<ResolvedSubscription> {
        ensure_user(user_id)?;
        let Some(subscription) = self.db.subscriptions().get_by_user(user_id).await? else {
            return Ok(ResolvedSubscription {
                subscription: None,
                plan: self.free_plan.clone(),
            });
        };

        let subscription = self.advance_if_expired(subscription, now).await?.subscription;
        let plan = match self.plan(&subscription.plan_id).await {
            Ok(plan) => plan,
            Err(MeterError::NotFound(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    plan_id = %subscription.plan_id,
                    "Subscription references an unknown plan, applying the free plan"
                );
                self.free_plan.clone()
            }
            Err(e) => return Err(e),
        };

        Ok(ResolvedSubscription {
            subscription: Some(subscription),
            plan,
        })
    }

    /// Move a subscription past an ended period.
    ///
    /// With auto-renew the next period starts at the stored end, never at
    /// `now`, so every caller computes the same boundaries and only one of
    /// them commits. Without auto-renew the subscription is expired.
    pub async fn advance_if_expired(
        &self,
        subscription: UserSubscription,
        now: DateTime<Utc>,
    ) -> MeterResult<AdvanceOutcome> {
        if subscription.status != SubscriptionStatus::Active || !subscription.is_period_over(now) {
            return Ok(AdvanceOutcome {
                subscription,
                rollover: Rollover::Unchanged,
            });
        }

        if subscription.auto_renew {
            self.renew(subscription, now).await
        } else {
            self.expire(subscription, now).await
        }
    }

    async fn renew(
        &self,
        subscription: UserSubscription,
        now: DateTime<Utc>,
    ) -> MeterResult<AdvanceOutcome> {
        let (period_start, period_end) = subscription.next_period_covering(now);
        let plan = self.plan(&subscription.plan_id).await?;
        let renewed = UserSubscription {
            current_period_start: period_start,
            current_period_end: period_end,
            updated_at: now,
            ..subscription.clone()
        };

        let commit = RenewalCommit {
            subscription: renewed.clone(),
            expected_period_end: Some(subscription.current_period_end),
            history: NewRenewalRecord {
                user_id: subscription.user_id.clone(),
                subscription_id: subscription.id,
                plan_id: subscription.plan_id.clone(),
                previous_plan_id: Some(subscription.plan_id.clone()),
                renewal_type: RenewalType::Renewal,
                previous_period_start: Some(subscription.current_period_start),
                previous_period_end: Some(subscription.current_period_end),
                new_period_start: period_start,
                new_period_end: period_end,
                usage_before_renewal: None,
                payment: PaymentMetadata::default(),
                created_at: now,
            },
            usage_period: Self::current_period(now),
        };

        let Some(record) = self.db.subscriptions().commit_renewal(commit).await? else {
            metrics::record_period_rollover("lost_race");
            tracing::debug!(
                user_id = %subscription.user_id,
                "Subscription was advanced concurrently, re-reading"
            );
            return self.reread(&subscription.user_id).await;
        };

        metrics::record_period_rollover("renewed");
        tracing::info!(
            user_id = %renewed.user_id,
            plan_id = %renewed.plan_id,
            period_start = %period_start,
            period_end = %period_end,
            "Auto-renewed subscription"
        );
        self.publish(RenewalEvent {
            user_id: renewed.user_id.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            tier_rank: plan.tier_rank,
            previous_plan_id: record.previous_plan_id.clone(),
            renewal_type: RenewalType::Renewal,
            billing_cycle: renewed.billing_cycle,
            period_start,
            period_end,
            usage_before_renewal: record.usage_before_renewal.clone(),
            timestamp: now,
        });

        Ok(AdvanceOutcome {
            subscription: renewed,
            rollover: Rollover::Renewed,
        })
    }

    async fn expire(
        &self,
        subscription: UserSubscription,
        now: DateTime<Utc>,
    ) -> MeterResult<AdvanceOutcome> {
        let expired = self
            .db
            .subscriptions()
            .expire(subscription.id, subscription.current_period_end, now)
            .await?;
        if !expired {
            metrics::record_period_rollover("lost_race");
            return self.reread(&subscription.user_id).await;
        }

        metrics::record_period_rollover("expired");
        tracing::info!(
            user_id = %subscription.user_id,
            plan_id = %subscription.plan_id,
            period_end = %subscription.current_period_end,
            "Subscription expired"
        );
        Ok(AdvanceOutcome {
            subscription: UserSubscription {
                status: SubscriptionStatus::Expired,
                updated_at: now,
                ..subscription
            },
            rollover: Rollover::Expired,
        })
    }

    async fn reread(&self, user_id: &str) -> MeterResult<AdvanceOutcome> {
        let subscription = self
            .db
            .subscriptions()
            .get_by_user(user_id)
            .await?
            .ok_or_else(|| MeterError::NotFound(format!("Subscription for '{user_id}'")))?;
        Ok(AdvanceOutcome {
            subscription,
            rollover: Rollover::Superseded,
        })
    }

    /// Put a user on a plan, starting a fresh period at `now`.
    ///
    /// The change is classified against the previous plan's rank, offered to
    /// the renewal hook, then committed together with its history record and
    /// the reset of the current period's counters. A hook failure aborts the
    /// change before anything is written.
    pub async fn subscribe(
        &self,
        user_id: &str,
        request: SubscribeRequest,
        now: DateTime<Utc>,
    ) -> MeterResult<SubscriptionChange> {
        ensure_user(user_id)?;
        let plan = self.plan(&request.plan_id).await?;
        let existing = self.db.subscriptions().get_by_user(user_id).await?;

        let previous_rank = match &existing {
            Some(previous) => match self.plan(&previous.plan_id).await {
                Ok(previous_plan) => previous_plan.tier_rank,
                Err(MeterError::NotFound(_)) => self.free_plan.tier_rank,
                Err(e) => return Err(e),
            },
            None => self.free_plan.tier_rank,
        };
        let renewal_type = RenewalType::classify(previous_rank, existing.is_some(), plan.tier_rank);

        let mut subscription = UserSubscription::start(
            user_id,
            &plan.id,
            request.billing_cycle,
            request.auto_renew,
            now,
        );
        if let Some(previous) = &existing {
            subscription.id = previous.id;
            subscription.created_at = previous.created_at;
        }

        let usage_period = Self::current_period(now);
        let usage_before = self
            .db
            .usage()
            .get(user_id, usage_period)
            .await?
            .as_ref()
            .map(UsageSnapshot::from);

        let mut event = RenewalEvent {
            user_id: user_id.to_string(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            tier_rank: plan.tier_rank,
            previous_plan_id: existing.as_ref().map(|s| s.plan_id.clone()),
            renewal_type,
            billing_cycle: request.billing_cycle,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            usage_before_renewal: usage_before,
            timestamp: now,
        };

        if let Some(hook) = &self.hook
            && let Err(e) = hook.before_commit(&event).await
        {
            tracing::warn!(
                user_id = %user_id,
                plan_id = %plan.id,
                retry_suggested = e.retry_suggested,
                error = %e,
                "Renewal hook rejected subscription change"
            );
            return Err(e.into());
        }

        let commit = RenewalCommit {
            subscription: subscription.clone(),
            expected_period_end: None,
            history: NewRenewalRecord {
                user_id: user_id.to_string(),
                subscription_id: subscription.id,
                plan_id: plan.id.clone(),
                previous_plan_id: event.previous_plan_id.clone(),
                renewal_type,
                previous_period_start: existing.as_ref().map(|s| s.current_period_start),
                previous_period_end: existing.as_ref().map(|s| s.current_period_end),
                new_period_start: subscription.current_period_start,
                new_period_end: subscription.current_period_end,
                usage_before_renewal: None,
                payment: request.payment,
                created_at: now,
            },
            usage_period,
        };
        let record = self
            .db
            .subscriptions()
            .commit_renewal(commit)
            .await?
            .ok_or_else(|| {
                MeterError::Database(DbError::Conflict(format!(
                    "Subscription change for '{user_id}' was not applied"
                )))
            })?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            renewal_type = renewal_type.as_str(),
            billing_cycle = %request.billing_cycle,
            period_end = %subscription.current_period_end,
            "Subscription changed"
        );

        // Publish the snapshot that was actually committed
        event.usage_before_renewal = record.usage_before_renewal.clone();
        self.publish(event);

        Ok(SubscriptionChange {
            subscription,
            plan,
            record,
        })
    }

    fn publish(&self, event: RenewalEvent) {
        let renewal_type = event.renewal_type;
        let receivers = self.events.publish(event);
        metrics::record_renewal_event(renewal_type.as_str(), receivers);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::{
        db::tests::harness::{create_sqlite_pool, plan, run_sqlite_migrations, seed_plans, test_now},
        events::HookError,
        models::UsageDelta,
    };

    async fn manager() -> (BillingPeriodManager, Arc<DbPool>, Arc<RenewalEventBus>) {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        let db = Arc::new(DbPool::from_sqlite(pool));
        seed_plans(db.plans().as_ref()).await;
        let events = Arc::new(RenewalEventBus::new());
        let manager = BillingPeriodManager::new(db.clone(), plan("free", 0, 10), events.clone());
        (manager, db, events)
    }

    async fn add_usage(db: &DbPool, calls: i64, at: DateTime<Utc>) {
        db.usage()
            .increment(
                "user-1",
                BillingPeriod::containing(at),
                &UsageDelta::new("openai", calls, 0, 0),
                at,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_without_subscription_is_free() {
        let (manager, _, _) = manager().await;
        let resolved = manager.resolve_subscription("user-1", test_now()).await.unwrap();
        assert!(resolved.is_synthesized());
        assert_eq!(resolved.plan.id, "free");
    }

    #[tokio::test]
    async fn test_subscribe_upgrade_from_free() {
        let (manager, db, events) = manager().await;
        let mut receiver = events.subscribe();
        add_usage(&db, 7, test_now()).await;

        let change = manager
            .subscribe("user-1", SubscribeRequest::new("pro", BillingCycle::Monthly), test_now())
            .await
            .unwrap();

        assert_eq!(change.record.renewal_type, RenewalType::Upgrade);
        assert_eq!(
            change.subscription.current_period_end,
            test_now() + Duration::days(30)
        );
        let snapshot = change.record.usage_before_renewal.clone().unwrap();
        assert_eq!(snapshot.total_calls, 7);

        let summary = db
            .usage()
            .get("user-1", BillingPeriod::containing(test_now()))
            .await
            .unwrap()
            .unwrap();
        assert!(summary.is_zero());

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.plan_name, "PRO");
        assert_eq!(event.usage_before_renewal, Some(snapshot));
    }

    #[tokio::test]
    async fn test_subscribe_classifies_changes() {
        let (manager, _, _) = manager().await;
        let now = test_now();
        let first = manager
            .subscribe("user-1", SubscribeRequest::new("free", BillingCycle::Monthly), now)
            .await
            .unwrap();
        assert_eq!(first.record.renewal_type, RenewalType::New);

        let up = manager
            .subscribe("user-1", SubscribeRequest::new("team", BillingCycle::Yearly), now)
            .await
            .unwrap();
        assert_eq!(up.record.renewal_type, RenewalType::Upgrade);
        assert_eq!(up.subscription.id, first.subscription.id);

        let same = manager
            .subscribe("user-1", SubscribeRequest::new("team", BillingCycle::Yearly), now)
            .await
            .unwrap();
        assert_eq!(same.record.renewal_type, RenewalType::Renewal);

        let down = manager
            .subscribe("user-1", SubscribeRequest::new("pro", BillingCycle::Monthly), now)
            .await
            .unwrap();
        assert_eq!(down.record.renewal_type, RenewalType::Downgrade);
        assert_eq!(down.record.previous_plan_id.as_deref(), Some("team"));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_plan() {
        let (manager, _, _) = manager().await;
        let err = manager
            .subscribe("user-1", SubscribeRequest::new("gold", BillingCycle::Monthly), test_now())
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::NotFound(_)));
    }

    struct RejectingHook;

    #[async_trait]
    impl RenewalHook for RejectingHook {
        async fn before_commit(&self, _event: &RenewalEvent) -> Result<(), HookError> {
            Err(HookError::retryable("payment provider unavailable"))
        }
    }

    #[tokio::test]
    async fn test_hook_failure_writes_nothing() {
        let (manager, db, events) = manager().await;
        let manager = manager.with_hook(Arc::new(RejectingHook));
        let mut receiver = events.subscribe();
        add_usage(&db, 3, test_now()).await;

        let err = manager
            .subscribe("user-1", SubscribeRequest::new("pro", BillingCycle::Monthly), test_now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeterError::ExternalService {
                retry_suggested: true,
                ..
            }
        ));

        assert!(db.subscriptions().get_by_user("user-1").await.unwrap().is_none());
        assert!(db.renewals().list_by_user("user-1", 10).await.unwrap().is_empty());
        let summary = db
            .usage()
            .get("user-1", BillingPeriod::containing(test_now()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_calls, 3);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auto_renew_uses_stored_boundary() {
        let (manager, db, events) = manager().await;
        let start = test_now();
        let change = manager
            .subscribe("user-1", SubscribeRequest::new("pro", BillingCycle::Monthly), start)
            .await
            .unwrap();
        let mut receiver = events.subscribe();

        let late = change.subscription.current_period_end + Duration::days(3);
        add_usage(&db, 4, late).await;

        let outcome = manager
            .advance_if_expired(change.subscription.clone(), late)
            .await
            .unwrap();
        assert_eq!(outcome.rollover, Rollover::Renewed);
        assert_eq!(
            outcome.subscription.current_period_start,
            change.subscription.current_period_end
        );
        assert_eq!(
            outcome.subscription.current_period_end,
            change.subscription.current_period_end + Duration::days(30)
        );

        // A second caller holding the stale row loses the race and sees the winner's row
        let again = manager
            .advance_if_expired(change.subscription.clone(), late)
            .await
            .unwrap();
        assert_eq!(again.rollover, Rollover::Superseded);
        assert_eq!(again.subscription, outcome.subscription);

        let history = db.renewals().list_by_user("user-1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].renewal_type, RenewalType::Renewal);
        assert_eq!(
            history[0].usage_before_renewal.as_ref().map(|s| s.total_calls),
            Some(4)
        );

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.renewal_type, RenewalType::Renewal);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_auto_renew_expires() {
        let (manager, db, _) = manager().await;
        let mut request = SubscribeRequest::new("pro", BillingCycle::Monthly);
        request.auto_renew = false;
        let change = manager.subscribe("user-1", request, test_now()).await.unwrap();

        let late = change.subscription.current_period_end + Duration::seconds(1);
        let resolved = manager.resolve_subscription("user-1", late).await.unwrap();
        assert!(resolved.is_expired());

        let stored = db.subscriptions().get_by_user("user-1").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
        // Expiry does not move the period or write history
        assert_eq!(stored.current_period_end, change.subscription.current_period_end);
        assert_eq!(db.renewals().list_by_user("user-1", 10).await.unwrap().len(), 1);

        // Subscribing again reactivates
        let renewed = manager
            .subscribe("user-1", SubscribeRequest::new("pro", BillingCycle::Monthly), late)
            .await
            .unwrap();
        assert_eq!(renewed.subscription.status, SubscriptionStatus::Active);
        assert_eq!(renewed.record.renewal_type, RenewalType::Renewal);
    }

    #[tokio::test]
    async fn test_within_period_is_unchanged() {
        let (manager, _, _) = manager().await;
        let change = manager
            .subscribe("user-1", SubscribeRequest::new("pro", BillingCycle::Monthly), test_now())
            .await
            .unwrap();
        let outcome = manager
            .advance_if_expired(change.subscription.clone(), test_now() + Duration::days(29))
            .await
            .unwrap();
        assert_eq!(outcome.rollover, Rollover::Unchanged);
        assert_eq!(outcome.subscription, change.subscription);
    }
}
