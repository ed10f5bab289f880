use std::sync::Arc;

use super::{UserLocks, usage_counters::ensure_user};
use crate::{
    config::CompactionConfig,
    db::{CompactionOutcome, DbPool},
    error::MeterResult,
    observability::metrics,
};

/// Collapses a user's old raw audit-log rows into one aggregated row once
/// the raw row count passes the configured threshold.
///
/// Sums are conserved and a run with nothing new to fold is a no-op. Runs for
/// the same user are serialized by a per-user lock; a run that waited on the
/// lock re-counts before doing anything.
pub struct LogCompactor {
    db: Arc<DbPool>,
    config: CompactionConfig,
    locks: UserLocks,
}

impl LogCompactor {
    pub fn new(db: Arc<DbPool>, config: CompactionConfig) -> Self {
        Self {
            db,
            config,
            locks: UserLocks::new(),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Compact the user's audit log if it is over the threshold.
    ///
    /// Returns `None` when nothing was compacted.
    pub async fn compact(&self, user_id: &str) -> MeterResult<Option<CompactionOutcome>> {
        ensure_user(user_id)?;
        if !self.config.enabled {
            return Ok(None);
        }

        let _guard = self.locks.acquire(user_id).await;

        let raw_rows = self.db.audit_logs().count_raw(user_id).await?;
        if raw_rows <= i64::from(self.config.threshold) {
            tracing::trace!(
                user_id = %user_id,
                raw_rows,
                threshold = self.config.threshold,
                "Audit log below compaction threshold"
            );
            return Ok(None);
        }

        let outcome = self
            .db
            .audit_logs()
            .compact(user_id, i64::from(self.config.keep_recent))
            .await?;

        if let Some(outcome) = &outcome {
            metrics::record_compaction(outcome.rows_folded);
            tracing::info!(
                user_id = %user_id,
                rows_folded = outcome.rows_folded,
                rows_represented = outcome
                    .aggregate
                    .aggregate
                    .as_ref()
                    .map(|d| d.rows_compacted)
                    .unwrap_or(0),
                "Compacted usage audit log"
            );
        }
        Ok(outcome)
    }

    /// Release locks of users with no sweep in flight.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}
