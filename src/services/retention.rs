//! Age-based degradation of renewal-history usage snapshots.
//!
//! | Age            | Tier               | Snapshot                  |
//! |----------------|--------------------|---------------------------|
//! | < 12 months    | `full`             | unchanged                 |
//! | 12..24 months  | `compressed`       | totals only               |
//! | 24..84 months  | `nulled`           | removed                   |
//! | >= 84 months   | `archive_eligible` | removed, flagged          |
//!
//! Payment and period fields are never touched, and records are never
//! deleted. Thresholds come from [`RetentionConfig`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{UserLocks, usage_counters::ensure_user};
use crate::{
    config::RetentionConfig,
    db::DbPool,
    error::MeterResult,
    models::{
        RenewalHistoryRecord, RetentionStats, RetentionTier, months_before, months_between,
    },
    observability::metrics,
};

/// Records fetched per query during a sweep.
const BATCH_SIZE: i64 = 500;

/// Lock key for sweeps over every user.
const ALL_USERS: &str = "*";

/// Results from a single retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionRunResult {
    pub compressed: u64,
    pub nulled: u64,
    pub archive_eligible: u64,
    /// Records another sweep moved first.
    pub skipped: u64,
}

impl RetentionRunResult {
    pub fn total(&self) -> u64 {
        self.compressed + self.nulled + self.archive_eligible
    }

    pub fn has_transitions(&self) -> bool {
        self.total() > 0
    }

    fn count(&mut self, tier: RetentionTier) {
        match tier {
            RetentionTier::Full => {}
            RetentionTier::Compressed => self.compressed += 1,
            RetentionTier::Nulled => self.nulled += 1,
            RetentionTier::ArchiveEligible => self.archive_eligible += 1,
        }
    }
}

pub struct RetentionTierManager {
    db: Arc<DbPool>,
    config: RetentionConfig,
    locks: UserLocks,
}

impl RetentionTierManager {
    pub fn new(db: Arc<DbPool>, config: RetentionConfig) -> Self {
        Self {
            db,
            config,
            locks: UserLocks::new(),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Tier a record created at `created_at` belongs in at `now`.
    pub fn tier_for_age(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> RetentionTier {
        self.config.tier_for_age(months_between(created_at, now))
    }

    /// Exclusive upper bound on the creation time of records due for `tier`.
    fn cutoff(&self, tier: RetentionTier, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = match tier {
            RetentionTier::Full => return None,
            RetentionTier::Compressed => self.config.compressed_after_months,
            RetentionTier::Nulled => self.config.nulled_after_months,
            RetentionTier::ArchiveEligible => self.config.archive_after_months,
        };
        months_before(now, months)
    }

    /// Move every record of `user_id` (or of all users) to the tier its age
    /// calls for. Records only ever move to a higher tier; running it again
    /// without time passing changes nothing.
    pub async fn apply(
        &self,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> MeterResult<RetentionRunResult> {
        if let Some(user_id) = user_id {
            ensure_user(user_id)?;
        }
        let mut result = RetentionRunResult::default();
        if !self.config.enabled {
            return Ok(result);
        }

        let _guard = self.locks.acquire(user_id.unwrap_or(ALL_USERS)).await;

        for target in [
            RetentionTier::ArchiveEligible,
            RetentionTier::Nulled,
            RetentionTier::Compressed,
        ] {
            let Some(cutoff) = self.cutoff(target, now) else {
                continue;
            };
            loop {
                let batch = self
                    .db
                    .renewals()
                    .list_for_retention(user_id, cutoff, target, BATCH_SIZE)
                    .await?;
                let fetched = batch.len();
                let mut moved = 0;
                for record in batch {
                    if self.transition(record, now, &mut result).await? {
                        moved += 1;
                    }
                }
                if (fetched as i64) < BATCH_SIZE || moved == 0 {
                    break;
                }
            }
        }

        if result.has_transitions() {
            tracing::info!(
                user_id = user_id.unwrap_or(ALL_USERS),
                compressed = result.compressed,
                nulled = result.nulled,
                archive_eligible = result.archive_eligible,
                skipped = result.skipped,
                "Retention pass complete"
            );
        } else {
            tracing::debug!(
                user_id = user_id.unwrap_or(ALL_USERS),
                "Retention pass complete, no records to transition"
            );
        }
        Ok(result)
    }

    async fn transition(
        &self,
        record: RenewalHistoryRecord,
        now: DateTime<Utc>,
        result: &mut RetentionRunResult,
    ) -> MeterResult<bool> {
        let target = self.tier_for_age(record.created_at, now);
        if target <= record.retention_tier {
            return Ok(false);
        }

        let snapshot = target.degrade(record.usage_before_renewal);
        let moved = self
            .db
            .renewals()
            .update_retention(record.id, record.retention_tier, target, snapshot.as_ref())
            .await?;
        if moved {
            metrics::record_retention_transition(record.retention_tier.as_str(), target.as_str());
            result.count(target);
        } else {
            result.skipped += 1;
        }
        Ok(moved)
    }

    /// Record counts per tier for one user, or all users.
    pub async fn stats(&self, user_id: Option<&str>) -> MeterResult<RetentionStats> {
        Ok(self.db.renewals().count_by_tier(user_id).await?)
    }

    /// Release locks of users with no sweep in flight.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Months, TimeZone};
    use rstest::rstest;
    use uuid::Uuid;

    use super::*;
    use crate::{
        db::tests::harness::{create_sqlite_pool, run_sqlite_migrations, test_now},
        models::{
            BillingPeriod, NewRenewalRecord, PaymentMetadata, ProviderUsage, RenewalType,
            UsageSnapshot, UsageStatus,
        },
    };

    async fn manager() -> (RetentionTierManager, Arc<DbPool>) {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        let db = Arc::new(DbPool::from_sqlite(pool));
        (
            RetentionTierManager::new(db.clone(), RetentionConfig::default()),
            db,
        )
    }

    fn months_ago(months: u32) -> DateTime<Utc> {
        test_now().checked_sub_months(Months::new(months)).unwrap()
    }

    async fn seed(db: &DbPool, user_id: &str, created_at: DateTime<Utc>) -> Uuid {
        let snapshot = UsageSnapshot {
            billing_period: BillingPeriod::containing(created_at),
            total_calls: 9,
            total_tokens: 900,
            total_cost_microcents: 4_000,
            status: Some(UsageStatus::Warning),
            providers: Some(vec![ProviderUsage {
                provider: "openai".into(),
                calls: 9,
                tokens: 900,
                cost_microcents: 4_000,
            }]),
        };
        db.renewals()
            .create(NewRenewalRecord {
                user_id: user_id.into(),
                subscription_id: Uuid::new_v4(),
                plan_id: "pro".into(),
                previous_plan_id: Some("free".into()),
                renewal_type: RenewalType::Upgrade,
                previous_period_start: None,
                previous_period_end: None,
                new_period_start: created_at,
                new_period_end: created_at + chrono::Duration::days(30),
                usage_before_renewal: Some(snapshot),
                payment: PaymentMetadata {
                    amount_microcents: Some(20_000_000),
                    currency: Some("usd".into()),
                    reference: Some("pi_123".into()),
                },
                created_at,
            })
            .await
            .unwrap()
            .id
    }

    #[rstest]
    #[case(0, RetentionTier::Full)]
    #[case(11, RetentionTier::Full)]
    #[case(12, RetentionTier::Compressed)]
    #[case(18, RetentionTier::Compressed)]
    #[case(24, RetentionTier::Nulled)]
    #[case(30, RetentionTier::Nulled)]
    #[case(83, RetentionTier::Nulled)]
    #[case(84, RetentionTier::ArchiveEligible)]
    #[case(120, RetentionTier::ArchiveEligible)]
    fn test_tier_for_age(#[case] months: u32, #[case] expected: RetentionTier) {
        let config = RetentionConfig::default();
        let age = months_between(months_ago(months), test_now());
        assert_eq!(age, months);
        assert_eq!(config.tier_for_age(age), expected);
    }

    #[tokio::test]
    async fn test_apply_degrades_by_age() {
        let (manager, db) = manager().await;
        let young = seed(&db, "user-1", months_ago(6)).await;
        let eighteen = seed(&db, "user-1", months_ago(18)).await;
        let thirty = seed(&db, "user-1", months_ago(30)).await;
        let ancient = seed(&db, "user-1", months_ago(90)).await;

        let result = manager.apply(Some("user-1"), test_now()).await.unwrap();
        assert_eq!(result.compressed, 1);
        assert_eq!(result.nulled, 1);
        assert_eq!(result.archive_eligible, 1);

        let young = db.renewals().get(young).await.unwrap().unwrap();
        assert_eq!(young.retention_tier, RetentionTier::Full);
        assert!(!young.usage_before_renewal.unwrap().is_compressed());

        let eighteen = db.renewals().get(eighteen).await.unwrap().unwrap();
        assert_eq!(eighteen.retention_tier, RetentionTier::Compressed);
        let compressed = eighteen.usage_before_renewal.unwrap();
        assert!(compressed.is_compressed());
        assert_eq!(compressed.total_tokens, 900);
        assert_eq!(eighteen.payment.reference.as_deref(), Some("pi_123"));
        assert_eq!(eighteen.payment.amount_microcents, Some(20_000_000));

        let thirty = db.renewals().get(thirty).await.unwrap().unwrap();
        assert_eq!(thirty.retention_tier, RetentionTier::Nulled);
        assert!(thirty.usage_before_renewal.is_none());
        assert_eq!(thirty.payment.currency.as_deref(), Some("usd"));

        let ancient = db.renewals().get(ancient).await.unwrap().unwrap();
        assert_eq!(ancient.retention_tier, RetentionTier::ArchiveEligible);
    }

    #[tokio::test]
    async fn test_apply_catches_leap_day_records_when_due() {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        let db = Arc::new(DbPool::from_sqlite(pool));
        let manager = RetentionTierManager::new(
            db.clone(),
            RetentionConfig {
                compressed_after_months: 13,
                ..Default::default()
            },
        );

        let leap_day = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
        let id = seed(&db, "user-1", leap_day).await;
        let now = Utc.with_ymd_and_hms(2025, 3, 30, 0, 0, 0).unwrap();
        assert_eq!(manager.tier_for_age(leap_day, now), RetentionTier::Compressed);

        let result = manager.apply(Some("user-1"), now).await.unwrap();
        assert_eq!(result.compressed, 1);
        let record = db.renewals().get(id).await.unwrap().unwrap();
        assert_eq!(record.retention_tier, RetentionTier::Compressed);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (manager, db) = manager().await;
        seed(&db, "user-1", months_ago(18)).await;
        seed(&db, "user-1", months_ago(30)).await;

        assert_eq!(manager.apply(Some("user-1"), test_now()).await.unwrap().total(), 2);
        let stats = manager.stats(Some("user-1")).await.unwrap();

        assert_eq!(
            manager.apply(Some("user-1"), test_now()).await.unwrap(),
            RetentionRunResult::default()
        );
        assert_eq!(manager.stats(Some("user-1")).await.unwrap(), stats);
    }

    #[tokio::test]
    async fn test_nulled_snapshot_never_restored() {
        let (manager, db) = manager().await;
        let id = seed(&db, "user-1", months_ago(30)).await;
        manager.apply(Some("user-1"), test_now()).await.unwrap();

        // A clock that moved backwards must not undo anything
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        manager.apply(Some("user-1"), earlier).await.unwrap();

        let record = db.renewals().get(id).await.unwrap().unwrap();
        assert_eq!(record.retention_tier, RetentionTier::Nulled);
        assert!(record.usage_before_renewal.is_none());
    }

    #[tokio::test]
    async fn test_apply_scoped_to_user() {
        let (manager, db) = manager().await;
        seed(&db, "user-1", months_ago(18)).await;
        let other = seed(&db, "user-2", months_ago(18)).await;

        manager.apply(Some("user-1"), test_now()).await.unwrap();
        let record = db.renewals().get(other).await.unwrap().unwrap();
        assert_eq!(record.retention_tier, RetentionTier::Full);

        let all = manager.apply(None, test_now()).await.unwrap();
        assert_eq!(all.compressed, 1);
        let stats = manager.stats(None).await.unwrap();
        assert_eq!(stats.compressed, 2);
        assert_eq!(stats.total(), 2);
    }
}
