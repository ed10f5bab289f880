use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::common::parse_period;
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{AuditLogRepo, CompactionOutcome},
    },
    models::{
        AGGREGATED_ENDPOINT, AGGREGATED_PROVIDER, AuditAggregate, AuditLogEntry, AuditTotals,
        NewAuditLogEntry,
    },
};

const ENTRY_COLUMNS: &str = "\
    id, user_id, occurred_at, provider, model, endpoint, calls, tokens, cost_microcents, \
    status_code, retry_count, billing_period, is_aggregated, aggregate_details";

// Well under SQLite's bound-parameter limit
const MAX_IDS_PER_DELETE: usize = 500;

pub struct SqliteAuditLogRepo {
    pool: SqlitePool,
}

impl SqliteAuditLogRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> DbResult<AuditLogEntry> {
        let is_aggregated: bool = row.get("is_aggregated");
        let details: Option<String> = row.get("aggregate_details");
        let aggregate = match (is_aggregated, details) {
            (true, Some(json)) => Some(serde_json::from_str(&json)?),
            (true, None) => Some(Default::default()),
            (false, _) => None,
        };

        Ok(AuditLogEntry {
            id: row.get("id"),
            user_id: row.get("user_id"),
            occurred_at: row.get("occurred_at"),
            provider: row.get("provider"),
            model: row.get("model"),
            endpoint: row.get("endpoint"),
            calls: row.get("calls"),
            tokens: row.get("tokens"),
            cost_microcents: row.get("cost_microcents"),
            status_code: row.get("status_code"),
            retry_count: row.get("retry_count"),
            billing_period: parse_period(&row.get::<String, _>("billing_period"))?,
            aggregate,
        })
    }
}

/// Insert one raw entry on an open connection.
/// Shared with the usage repo, which logs inside its increment transaction.
pub(super) async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: NewAuditLogEntry,
) -> DbResult<AuditLogEntry> {
    let result = sqlx::query(
        r#"
        INSERT INTO usage_audit_logs (
            user_id, occurred_at, provider, model, endpoint, calls, tokens,
            cost_microcents, status_code, retry_count, billing_period, is_aggregated
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(&entry.user_id)
    .bind(entry.occurred_at)
    .bind(&entry.provider)
    .bind(&entry.model)
    .bind(&entry.endpoint)
    .bind(entry.calls)
    .bind(entry.tokens)
    .bind(entry.cost_microcents)
    .bind(entry.status_code)
    .bind(entry.retry_count)
    .bind(entry.billing_period.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(AuditLogEntry {
        id: result.last_insert_rowid(),
        user_id: entry.user_id,
        occurred_at: entry.occurred_at,
        provider: entry.provider,
        model: entry.model,
        endpoint: entry.endpoint,
        calls: entry.calls,
        tokens: entry.tokens,
        cost_microcents: entry.cost_microcents,
        status_code: entry.status_code,
        retry_count: entry.retry_count,
        billing_period: entry.billing_period,
        aggregate: None,
    })
}

#[async_trait]
impl AuditLogRepo for SqliteAuditLogRepo {
    async fn append(&self, entry: NewAuditLogEntry) -> DbResult<AuditLogEntry> {
        let mut conn = self.pool.acquire().await?;
        insert_entry(&mut conn, entry).await
    }

    async fn count_raw(&self, user_id: &str) -> DbResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM usage_audit_logs WHERE user_id = ? AND is_aggregated = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("count"))
    }

    async fn list_recent(&self, user_id: &str, limit: i64) -> DbResult<Vec<AuditLogEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM usage_audit_logs \
             WHERE user_id = ? ORDER BY occurred_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn totals(&self, user_id: &str) -> DbResult<AuditTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as row_count,
                COALESCE(SUM(calls), 0) as calls,
                COALESCE(SUM(tokens), 0) as tokens,
                COALESCE(SUM(cost_microcents), 0) as cost_microcents
            FROM usage_audit_logs
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(AuditTotals {
            rows: row.get("row_count"),
            calls: row.get("calls"),
            tokens: row.get("tokens"),
            cost_microcents: row.get("cost_microcents"),
        })
    }

    async fn compact(
        &self,
        user_id: &str,
        keep_recent: i64,
    ) -> DbResult<Option<CompactionOutcome>> {
        let mut tx = self.pool.begin().await?;

        // Everything past the newest `keep_recent` raw rows
        let raw_query = format!(
            "SELECT {ENTRY_COLUMNS} FROM usage_audit_logs \
             WHERE user_id = ? AND is_aggregated = 0 \
             ORDER BY occurred_at DESC, id DESC LIMIT -1 OFFSET ?"
        );
        let raw: Vec<AuditLogEntry> = sqlx::query(&raw_query)
            .bind(user_id)
            .bind(keep_recent.max(0))
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(Self::entry_from_row)
            .collect::<DbResult<_>>()?;

        if raw.is_empty() {
            return Ok(None);
        }

        let previous_query = format!(
            "SELECT {ENTRY_COLUMNS} FROM usage_audit_logs WHERE user_id = ? AND is_aggregated = 1"
        );
        let previous: Vec<AuditLogEntry> = sqlx::query(&previous_query)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(Self::entry_from_row)
            .collect::<DbResult<_>>()?;

        let rows_folded = raw.len() as i64;
        let mut folded = previous;
        folded.extend(raw);
        let Some(aggregate) = AuditAggregate::fold(&folded) else {
            return Ok(None);
        };

        let ids: Vec<i64> = folded.iter().map(|r| r.id).collect();
        let mut deleted = 0u64;
        for chunk in ids.chunks(MAX_IDS_PER_DELETE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let query = format!("DELETE FROM usage_audit_logs WHERE id IN ({placeholders})");
            let mut delete = sqlx::query(&query);
            for id in chunk {
                delete = delete.bind(*id);
            }
            deleted += delete.execute(&mut *tx).await?.rows_affected();
        }

        if deleted != ids.len() as u64 {
            // Another writer removed some of these rows; folding now would double count
            return Err(DbError::Conflict(format!(
                "Audit log rows for user {} changed during compaction",
                user_id
            )));
        }

        let details_json = serde_json::to_string(&aggregate.details)?;
        let result = sqlx::query(
            r#"
            INSERT INTO usage_audit_logs (
                user_id, occurred_at, provider, model, endpoint, calls, tokens,
                cost_microcents, status_code, retry_count, billing_period,
                is_aggregated, aggregate_details
            )
            VALUES (?, ?, ?, NULL, ?, ?, ?, ?, NULL, ?, ?, 1, ?)
            "#,
        )
        .bind(&aggregate.user_id)
        .bind(aggregate.occurred_at)
        .bind(AGGREGATED_PROVIDER)
        .bind(AGGREGATED_ENDPOINT)
        .bind(aggregate.calls)
        .bind(aggregate.tokens)
        .bind(aggregate.cost_microcents)
        .bind(aggregate.retry_count)
        .bind(aggregate.billing_period.to_string())
        .bind(&details_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(CompactionOutcome {
            rows_folded,
            aggregate: AuditLogEntry {
                id: result.last_insert_rowid(),
                user_id: aggregate.user_id,
                occurred_at: aggregate.occurred_at,
                provider: AGGREGATED_PROVIDER.to_string(),
                model: None,
                endpoint: AGGREGATED_ENDPOINT.to_string(),
                calls: aggregate.calls,
                tokens: aggregate.tokens,
                cost_microcents: aggregate.cost_microcents,
                status_code: None,
                retry_count: aggregate.retry_count,
                billing_period: aggregate.billing_period,
                aggregate: Some(aggregate.details),
            },
        }))
    }
}
