//! Shared tests for RenewalHistoryRepo implementations

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::harness::test_now;
use crate::{
    db::repos::RenewalHistoryRepo,
    models::{
        BillingPeriod, NewRenewalRecord, PaymentMetadata, RenewalType, RetentionTier,
        UsageSnapshot, UsageStatus,
    },
};

fn snapshot() -> UsageSnapshot {
    UsageSnapshot {
        billing_period: BillingPeriod::new(2024, 1).unwrap(),
        total_calls: 12,
        total_tokens: 3400,
        total_cost_microcents: 9_000,
        status: Some(UsageStatus::Warning),
        providers: Some(Vec::new()),
    }
}

fn record(user_id: &str, created_at: DateTime<Utc>) -> NewRenewalRecord {
    NewRenewalRecord {
        user_id: user_id.to_string(),
        subscription_id: Uuid::new_v4(),
        plan_id: "pro".to_string(),
        previous_plan_id: Some("free".to_string()),
        renewal_type: RenewalType::Renewal,
        previous_period_start: Some(created_at - Duration::days(30)),
        previous_period_end: Some(created_at),
        new_period_start: created_at,
        new_period_end: created_at + Duration::days(30),
        usage_before_renewal: Some(snapshot()),
        payment: PaymentMetadata {
            amount_microcents: Some(20_000_000),
            currency: Some("usd".to_string()),
            reference: Some("inv_123".to_string()),
        },
        created_at,
    }
}

pub async fn test_create_and_get(repo: &dyn RenewalHistoryRepo) {
    let created = repo
        .create(record("user-1", test_now()))
        .await
        .expect("Failed to create");
    assert_eq!(created.retention_tier, RetentionTier::Full);

    let fetched = repo.get(created.id).await.unwrap().expect("Record should exist");
    assert_eq!(fetched, created);
    assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
}

pub async fn test_list_by_user_newest_first(repo: &dyn RenewalHistoryRepo) {
    repo.create(record("user-1", test_now() - Duration::days(60))).await.unwrap();
    let newest = repo.create(record("user-1", test_now())).await.unwrap();
    repo.create(record("user-2", test_now())).await.unwrap();

    let records = repo.list_by_user("user-1", 10).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, newest.id);
}

pub async fn test_list_for_retention_filters(repo: &dyn RenewalHistoryRepo) {
    let old = repo
        .create(record("user-1", test_now() - Duration::days(500)))
        .await
        .unwrap();
    repo.create(record("user-1", test_now())).await.unwrap();
    let other = repo
        .create(record("user-2", test_now() - Duration::days(900)))
        .await
        .unwrap();

    let cutoff = test_now() - Duration::days(365);
    let all = repo
        .list_for_retention(None, cutoff, RetentionTier::ArchiveEligible, 100)
        .await
        .unwrap();
    let ids: Vec<_> = all.iter().map(|r| r.id).collect();
    // Oldest first
    assert_eq!(ids, vec![other.id, old.id]);

    let scoped = repo
        .list_for_retention(Some("user-1"), cutoff, RetentionTier::ArchiveEligible, 100)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].id, old.id);

    // Records already at or above the requested tier are done
    repo.update_retention(other.id, RetentionTier::Full, RetentionTier::Compressed, None)
        .await
        .unwrap();
    let below_compressed = repo
        .list_for_retention(None, cutoff, RetentionTier::Compressed, 100)
        .await
        .unwrap();
    assert_eq!(below_compressed.len(), 1);
    assert_eq!(below_compressed[0].id, old.id);
    assert_eq!(
        repo.list_for_retention(None, cutoff, RetentionTier::Nulled, 100)
            .await
            .unwrap()
            .len(),
        2
    );
    assert!(
        repo.list_for_retention(None, cutoff, RetentionTier::Full, 100)
            .await
            .unwrap()
            .is_empty()
    );
}

pub async fn test_update_retention_is_conditional(repo: &dyn RenewalHistoryRepo) {
    let created = repo.create(record("user-1", test_now())).await.unwrap();
    let compressed = snapshot().compress();

    assert!(repo
        .update_retention(created.id, RetentionTier::Full, RetentionTier::Compressed, Some(&compressed))
        .await
        .unwrap());
    // A second sweep that read the old tier loses
    assert!(!repo
        .update_retention(created.id, RetentionTier::Full, RetentionTier::Compressed, Some(&compressed))
        .await
        .unwrap());

    let fetched = repo.get(created.id).await.unwrap().unwrap();
    assert_eq!(fetched.retention_tier, RetentionTier::Compressed);
    assert_eq!(fetched.usage_before_renewal, Some(compressed));
    assert_eq!(fetched.payment, created.payment);
}

pub async fn test_count_by_tier(repo: &dyn RenewalHistoryRepo) {
    let a = repo.create(record("user-1", test_now())).await.unwrap();
    repo.create(record("user-1", test_now())).await.unwrap();
    repo.create(record("user-2", test_now())).await.unwrap();
    repo.update_retention(a.id, RetentionTier::Full, RetentionTier::Nulled, None)
        .await
        .unwrap();

    let user_stats = repo.count_by_tier(Some("user-1")).await.unwrap();
    assert_eq!(user_stats.full, 1);
    assert_eq!(user_stats.nulled, 1);
    assert_eq!(user_stats.total(), 2);

    let all = repo.count_by_tier(None).await.unwrap();
    assert_eq!(all.full, 2);
    assert_eq!(all.total(), 3);
}

// ============================================================================
// SQLite Tests
// ============================================================================

mod sqlite_tests {
    use crate::db::{
        sqlite::SqliteRenewalHistoryRepo,
        tests::harness::{create_sqlite_pool, run_sqlite_migrations},
    };

    async fn create_repo() -> SqliteRenewalHistoryRepo {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        SqliteRenewalHistoryRepo::new(pool)
    }

    macro_rules! sqlite_test {
        ($name:ident) => {
            #[tokio::test]
            async fn $name() {
                let repo = create_repo().await;
                super::$name(&repo).await;
            }
        };
    }

    sqlite_test!(test_create_and_get);
    sqlite_test!(test_list_by_user_newest_first);
    sqlite_test!(test_list_for_retention_filters);
    sqlite_test!(test_update_retention_is_conditional);
    sqlite_test!(test_count_by_tier);
}
