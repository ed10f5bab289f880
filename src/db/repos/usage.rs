use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{
        AuditLogEntry, BillingPeriod, NewAuditLogEntry, UsageDelta, UsageStatus, UsageSummary,
    },
};

#[async_trait]
pub trait UsageSummaryRepo: Send + Sync {
    /// Add `delta` to the user's counters for `period`.
    ///
    /// The summary and provider rows are created on first use. Counters are
    /// updated in place by the database (`x = x + delta`) so concurrent
    /// increments never overwrite each other.
    async fn increment(
        &self,
        user_id: &str,
        period: BillingPeriod,
        delta: &UsageDelta,
        at: DateTime<Utc>,
    ) -> DbResult<UsageSummary>;

    /// Add `delta` to the counters of `entry`'s user and period, and append
    /// `entry` to the audit log, in one transaction.
    async fn record(
        &self,
        delta: &UsageDelta,
        entry: NewAuditLogEntry,
    ) -> DbResult<(UsageSummary, AuditLogEntry)>;

    /// Get the summary for a period, `None` if it was never created.
    async fn get(&self, user_id: &str, period: BillingPeriod) -> DbResult<Option<UsageSummary>>;

    /// Get the summary for a period, creating a zeroed row if missing.
    async fn get_or_create(
        &self,
        user_id: &str,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> DbResult<UsageSummary>;

    /// Zero every counter of a period and set its status back to active.
    /// Returns false when no summary existed.
    async fn reset(&self, user_id: &str, period: BillingPeriod, now: DateTime<Utc>)
    -> DbResult<bool>;

    /// Raise the status of a summary. Never lowers it.
    /// Returns true only when this call changed the status.
    async fn escalate_status(
        &self,
        user_id: &str,
        period: BillingPeriod,
        status: UsageStatus,
    ) -> DbResult<bool>;

    /// Summaries between `from` and `to` inclusive, oldest first.
    /// Periods without a row are omitted.
    async fn list_range(
        &self,
        user_id: &str,
        from: BillingPeriod,
        to: BillingPeriod,
    ) -> DbResult<Vec<UsageSummary>>;
}
