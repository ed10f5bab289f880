use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    db::error::DbResult,
    models::{NewRenewalRecord, RenewalHistoryRecord, RetentionStats, RetentionTier, UsageSnapshot},
};

#[async_trait]
pub trait RenewalHistoryRepo: Send + Sync {
    /// Insert a history record outside of a subscription change, e.g. when
    /// importing records from another system.
    async fn create(&self, record: NewRenewalRecord) -> DbResult<RenewalHistoryRecord>;

    async fn get(&self, id: Uuid) -> DbResult<Option<RenewalHistoryRecord>>;

    /// Newest first.
    async fn list_by_user(&self, user_id: &str, limit: i64) -> DbResult<Vec<RenewalHistoryRecord>>;

    /// Records created before `created_before` whose tier is still lower
    /// than `below`, oldest first. Scoped to one user when `user_id` is set.
    async fn list_for_retention(
        &self,
        user_id: Option<&str>,
        created_before: DateTime<Utc>,
        below: RetentionTier,
        limit: i64,
    ) -> DbResult<Vec<RenewalHistoryRecord>>;

    /// Move a record from `from` to `to`, replacing its snapshot.
    ///
    /// Conditional on the stored tier still being `from`; returns false when
    /// another sweep got there first.
    async fn update_retention(
        &self,
        id: Uuid,
        from: RetentionTier,
        to: RetentionTier,
        snapshot: Option<&UsageSnapshot>,
    ) -> DbResult<bool>;

    /// Record counts per tier. All users when `user_id` is `None`.
    async fn count_by_tier(&self, user_id: Option<&str>) -> DbResult<RetentionStats>;
}
