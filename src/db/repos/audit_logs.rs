use async_trait::async_trait;
use serde::Serialize;

use crate::{
    db::error::DbResult,
    models::{AuditLogEntry, AuditTotals, NewAuditLogEntry},
};

/// Result of one compaction.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionOutcome {
    /// Raw rows folded by this run.
    pub rows_folded: i64,
    /// The aggregated row now standing in for them.
    pub aggregate: AuditLogEntry,
}

#[async_trait]
pub trait AuditLogRepo: Send + Sync {
    /// Append a raw row.
    async fn append(&self, entry: NewAuditLogEntry) -> DbResult<AuditLogEntry>;

    /// Number of raw (not aggregated) rows for a user.
    async fn count_raw(&self, user_id: &str) -> DbResult<i64>;

    /// Most recent rows first, aggregated rows included.
    async fn list_recent(&self, user_id: &str, limit: i64) -> DbResult<Vec<AuditLogEntry>>;

    /// Sums over every row of a user.
    async fn totals(&self, user_id: &str) -> DbResult<AuditTotals>;

    /// Fold every raw row except the `keep_recent` newest, together with any
    /// existing aggregated row, into a single aggregated row.
    ///
    /// Runs in one transaction. Returns `None` without writing when there are
    /// no raw rows beyond `keep_recent`.
    async fn compact(&self, user_id: &str, keep_recent: i64)
    -> DbResult<Option<CompactionOutcome>>;
}
