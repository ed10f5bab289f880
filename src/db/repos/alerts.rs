use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::error::DbResult,
    models::{NewUsageAlert, UsageAlert},
};

#[async_trait]
pub trait AlertRepo: Send + Sync {
    /// Create an alert. Returns `None` when the same user, period, provider
    /// and kind already has one.
    async fn create(&self, alert: NewUsageAlert) -> DbResult<Option<UsageAlert>>;

    async fn get(&self, id: Uuid) -> DbResult<Option<UsageAlert>>;

    /// Newest first.
    async fn list_by_user(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> DbResult<Vec<UsageAlert>>;

    async fn count_unread(&self, user_id: &str) -> DbResult<i64>;

    /// Returns false when the alert does not exist.
    async fn mark_read(&self, id: Uuid) -> DbResult<bool>;
}
