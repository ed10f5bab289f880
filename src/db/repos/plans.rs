use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{db::error::DbResult, models::SubscriptionPlan};

#[async_trait]
pub trait PlanRepo: Send + Sync {
    /// Insert or replace a plan and its provider limits.
    async fn upsert(&self, plan: &SubscriptionPlan, now: DateTime<Utc>) -> DbResult<()>;

    async fn get(&self, id: &str) -> DbResult<Option<SubscriptionPlan>>;

    /// All plans ordered by tier rank.
    async fn list(&self) -> DbResult<Vec<SubscriptionPlan>>;
}
