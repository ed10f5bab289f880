use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    db::error::DbResult,
    models::{BillingPeriod, NewRenewalRecord, RenewalHistoryRecord, UserSubscription},
};

/// A subscription change written in a single transaction.
#[derive(Debug, Clone)]
pub struct RenewalCommit {
    /// The subscription row as it should look afterwards.
    pub subscription: UserSubscription,
    /// When set, the change only applies if the stored row still ends at
    /// this instant. Used for auto-renewal so racing callers commit once.
    pub expected_period_end: Option<DateTime<Utc>>,
    pub history: NewRenewalRecord,
    /// Counter period snapshotted into the history record and then zeroed.
    pub usage_period: BillingPeriod,
}

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn get_by_user(&self, user_id: &str) -> DbResult<Option<UserSubscription>>;

    /// Store a subscription change together with its history record and the
    /// counter reset.
    ///
    /// The history record's usage snapshot is read inside the transaction,
    /// so it always matches the counters that were zeroed. Returns `None`
    /// when `expected_period_end` no longer matches; nothing is written then.
    async fn commit_renewal(&self, commit: RenewalCommit)
    -> DbResult<Option<RenewalHistoryRecord>>;

    /// Mark an active subscription expired if it still ends at
    /// `expected_period_end`. Returns true when this call expired it.
    async fn expire(
        &self,
        id: Uuid,
        expected_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;
}
