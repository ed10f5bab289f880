//! Test harness for database repository testing
//!
//! SQLite in-memory databases with the real migrations applied.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::{
    db::repos::PlanRepo,
    models::{ProviderLimit, SubscriptionPlan, UsageLimit},
};

/// Create an in-memory SQLite pool for testing
pub async fn create_sqlite_pool() -> SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

/// Run SQLite migrations on the pool
///
/// Uses the actual migration files to ensure tests match production schema
pub async fn run_sqlite_migrations(pool: &SqlitePool) {
    sqlx::migrate!("./migrations_sqlx/sqlite")
        .run(pool)
        .await
        .expect("Failed to run SQLite migrations");
}

/// Fixed reference instant so tests do not depend on the wall clock
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
}

pub fn plan(id: &str, tier_rank: i32, calls: i64) -> SubscriptionPlan {
    SubscriptionPlan {
        id: id.to_string(),
        name: id.to_uppercase(),
        tier_rank,
        monthly_cost_ceiling: UsageLimit::Unlimited,
        limits: vec![ProviderLimit {
            provider: "openai".to_string(),
            max_calls: UsageLimit::from_stored(calls),
            max_tokens: UsageLimit::Unlimited,
        }],
    }
}

/// Insert the plans subscriptions in these tests refer to
pub async fn seed_plans(repo: &dyn PlanRepo) {
    for plan in [plan("free", 0, 10), plan("pro", 10, 1000), plan("team", 20, 0)] {
        repo.upsert(&plan, test_now())
            .await
            .expect("Failed to seed plan");
    }
}
