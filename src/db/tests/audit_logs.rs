//! Shared tests for AuditLogRepo implementations

use chrono::Duration;

use super::harness::test_now;
use crate::{
    db::repos::AuditLogRepo,
    models::{AGGREGATED_ENDPOINT, BillingPeriod, NewAuditLogEntry},
};

fn entry(user_id: &str, minutes: i64, tokens: i64, status: Option<i32>) -> NewAuditLogEntry {
    NewAuditLogEntry {
        user_id: user_id.to_string(),
        occurred_at: test_now() + Duration::minutes(minutes),
        provider: "openai".to_string(),
        model: Some("gpt-4o".to_string()),
        endpoint: "chat".to_string(),
        calls: 1,
        tokens,
        cost_microcents: tokens * 3,
        status_code: status,
        retry_count: 0,
        billing_period: BillingPeriod::containing(test_now()),
    }
}

async fn append_many(repo: &dyn AuditLogRepo, user_id: &str, count: i64) {
    for i in 0..count {
        repo.append(entry(user_id, i, 10 + i, Some(200)))
            .await
            .expect("Failed to append");
    }
}

pub async fn test_append_and_count(repo: &dyn AuditLogRepo) {
    let first = repo.append(entry("user-1", 0, 10, Some(200))).await.unwrap();
    let second = repo.append(entry("user-1", 1, 10, None)).await.unwrap();
    repo.append(entry("user-2", 0, 10, None)).await.unwrap();

    assert!(second.id > first.id);
    assert!(!first.is_aggregated());
    assert_eq!(repo.count_raw("user-1").await.unwrap(), 2);
    assert_eq!(repo.count_raw("user-3").await.unwrap(), 0);
}

pub async fn test_list_recent_newest_first(repo: &dyn AuditLogRepo) {
    repo.append(entry("user-1", 5, 10, Some(200))).await.unwrap();
    repo.append(entry("user-1", 1, 20, Some(200))).await.unwrap();
    repo.append(entry("user-1", 9, 30, Some(200))).await.unwrap();

    let rows = repo.list_recent("user-1", 2).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].tokens, 30);
    assert_eq!(rows[1].tokens, 10);
}

pub async fn test_compact_conserves_sums(repo: &dyn AuditLogRepo) {
    append_many(repo, "user-1", 12).await;
    append_many(repo, "user-2", 3).await;
    let before = repo.totals("user-1").await.unwrap();

    let outcome = repo
        .compact("user-1", 4)
        .await
        .unwrap()
        .expect("Expected rows to compact");
    assert_eq!(outcome.rows_folded, 8);

    let after = repo.totals("user-1").await.unwrap();
    assert_eq!(after.tokens, before.tokens);
    assert_eq!(after.cost_microcents, before.cost_microcents);
    assert_eq!(after.calls, before.calls);
    assert_eq!(after.rows, 5);
    assert_eq!(repo.count_raw("user-1").await.unwrap(), 4);

    // Other users are untouched
    assert_eq!(repo.count_raw("user-2").await.unwrap(), 3);
}

pub async fn test_compact_aggregate_keeps_recency_order(repo: &dyn AuditLogRepo) {
    append_many(repo, "user-1", 6).await;
    repo.compact("user-1", 2).await.unwrap().unwrap();

    let rows = repo.list_recent("user-1", 10).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(!rows[0].is_aggregated());
    assert!(!rows[1].is_aggregated());

    let aggregate = &rows[2];
    assert_eq!(aggregate.endpoint, AGGREGATED_ENDPOINT);
    // Timestamped at the newest compacted row (minute 3)
    assert_eq!(aggregate.occurred_at, test_now() + Duration::minutes(3));
    let details = aggregate.aggregate.as_ref().unwrap();
    assert_eq!(details.rows_compacted, 4);
    assert_eq!(details.status_breakdown["200"], 4);
    assert_eq!(details.earliest_at, Some(test_now()));
}

pub async fn test_compact_twice_is_noop(repo: &dyn AuditLogRepo) {
    append_many(repo, "user-1", 10).await;
    repo.compact("user-1", 3).await.unwrap().unwrap();
    let rows_before = repo.list_recent("user-1", 100).await.unwrap();

    assert!(repo.compact("user-1", 3).await.unwrap().is_none());
    assert_eq!(repo.list_recent("user-1", 100).await.unwrap(), rows_before);
}

pub async fn test_compact_merges_previous_aggregate(repo: &dyn AuditLogRepo) {
    append_many(repo, "user-1", 6).await;
    repo.compact("user-1", 2).await.unwrap().unwrap();
    let before = repo.totals("user-1").await.unwrap();

    for i in 0..4 {
        repo.append(entry("user-1", 100 + i, 5, Some(429))).await.unwrap();
    }
    let outcome = repo.compact("user-1", 2).await.unwrap().unwrap();
    assert_eq!(outcome.rows_folded, 4);

    let details = outcome.aggregate.aggregate.as_ref().unwrap();
    assert_eq!(details.rows_compacted, 8);
    assert_eq!(details.status_breakdown["200"], 6);
    assert_eq!(details.status_breakdown["429"], 2);

    let after = repo.totals("user-1").await.unwrap();
    assert_eq!(after.tokens, before.tokens + 20);
    // One aggregate plus the two newest raw rows
    assert_eq!(after.rows, 3);
}

pub async fn test_compact_below_keep_recent(repo: &dyn AuditLogRepo) {
    append_many(repo, "user-1", 3).await;
    assert!(repo.compact("user-1", 5).await.unwrap().is_none());
    assert_eq!(repo.count_raw("user-1").await.unwrap(), 3);
}

// ============================================================================
// SQLite Tests
// ============================================================================

mod sqlite_tests {
    use crate::db::{
        sqlite::SqliteAuditLogRepo,
        tests::harness::{create_sqlite_pool, run_sqlite_migrations},
    };

    async fn create_repo() -> SqliteAuditLogRepo {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        SqliteAuditLogRepo::new(pool)
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

    sqlite_test!(test_append_and_count);
    sqlite_test!(test_list_recent_newest_first);
    sqlite_test!(test_compact_conserves_sums);
    sqlite_test!(test_compact_aggregate_keeps_recency_order);
    sqlite_test!(test_compact_twice_is_noop);
    sqlite_test!(test_compact_merges_previous_aggregate);
    sqlite_test!(test_compact_below_keep_recent);
}
