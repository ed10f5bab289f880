use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{
    audit_logs::insert_entry,
    common::{parse_column, parse_period},
};
use crate::{
    db::{error::DbResult, repos::UsageSummaryRepo},
    models::{
        AuditLogEntry, BillingPeriod, NewAuditLogEntry, ProviderUsage, UsageDelta, UsageStatus,
        UsageSummary,
    },
};

pub struct SqliteUsageSummaryRepo {
    pool: SqlitePool,
}

impl SqliteUsageSummaryRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn provider_from_row(row: &sqlx::sqlite::SqliteRow) -> ProviderUsage {
        ProviderUsage {
            provider: row.get("provider"),
            calls: row.get("calls"),
            tokens: row.get("tokens"),
            cost_microcents: row.get("cost_microcents"),
        }
    }

    fn summary_from_row(
        user_id: &str,
        row: &sqlx::sqlite::SqliteRow,
        providers: Vec<ProviderUsage>,
    ) -> DbResult<UsageSummary> {
        Ok(UsageSummary {
            user_id: user_id.to_string(),
            billing_period: parse_period(&row.get::<String, _>("billing_period"))?,
            providers,
            total_calls: row.get("total_calls"),
            total_tokens: row.get("total_tokens"),
            total_cost_microcents: row.get("total_cost_microcents"),
            status: parse_column(&row.get::<String, _>("status"))?,
            updated_at: row.get("updated_at"),
        })
    }
}

/// Load one summary with its provider counters on an open connection.
pub(super) async fn fetch_summary(
    conn: &mut SqliteConnection,
    user_id: &str,
    period: BillingPeriod,
) -> DbResult<Option<UsageSummary>> {
    let period_str = period.to_string();
    let row = sqlx::query(
        r#"
        SELECT billing_period, total_calls, total_tokens, total_cost_microcents, status, updated_at
        FROM usage_summaries
        WHERE user_id = ? AND billing_period = ?
        "#,
    )
    .bind(user_id)
    .bind(&period_str)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let providers = sqlx::query(
        r#"
        SELECT provider, calls, tokens, cost_microcents
        FROM usage_provider_counters
        WHERE user_id = ? AND billing_period = ?
        ORDER BY provider
        "#,
    )
    .bind(user_id)
    .bind(&period_str)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(SqliteUsageSummaryRepo::provider_from_row)
    .collect();

    SqliteUsageSummaryRepo::summary_from_row(user_id, &row, providers).map(Some)
}

/// Zero the counters of one period on an open connection.
/// Shared with the subscription repo, which resets inside its own transaction.
pub(super) async fn reset_counters(
    conn: &mut SqliteConnection,
    user_id: &str,
    period: BillingPeriod,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let period_str = period.to_string();
    let result = sqlx::query(
        r#"
        UPDATE usage_summaries
        SET total_calls = 0, total_tokens = 0, total_cost_microcents = 0,
            status = 'active', updated_at = ?
        WHERE user_id = ? AND billing_period = ?
        "#,
    )
    .bind(now)
    .bind(user_id)
    .bind(&period_str)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE usage_provider_counters
        SET calls = 0, tokens = 0, cost_microcents = 0, updated_at = ?
        WHERE user_id = ? AND billing_period = ?
        "#,
    )
    .bind(now)
    .bind(user_id)
    .bind(&period_str)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Add a delta to the summary and provider counters on an open connection.
/// Shared with [`UsageSummaryRepo::record`], which logs in the same transaction.
pub(super) async fn add_usage(
    conn: &mut SqliteConnection,
    user_id: &str,
    period: BillingPeriod,
    delta: &UsageDelta,
    at: DateTime<Utc>,
) -> DbResult<UsageSummary> {
    let period_str = period.to_string();

    // The summary row goes first: provider counters reference it
    sqlx::query(
        r#"
        INSERT INTO usage_summaries (
            user_id, billing_period, total_calls, total_tokens,
            total_cost_microcents, status, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
        ON CONFLICT (user_id, billing_period) DO UPDATE SET
            total_calls = total_calls + excluded.total_calls,
            total_tokens = total_tokens + excluded.total_tokens,
            total_cost_microcents = total_cost_microcents + excluded.total_cost_microcents,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(&period_str)
    .bind(delta.calls)
    .bind(delta.tokens)
    .bind(delta.cost_microcents)
    .bind(at)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO usage_provider_counters (
            user_id, billing_period, provider, calls, tokens, cost_microcents, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (user_id, billing_period, provider) DO UPDATE SET
            calls = calls + excluded.calls,
            tokens = tokens + excluded.tokens,
            cost_microcents = cost_microcents + excluded.cost_microcents,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(&period_str)
    .bind(&delta.provider)
    .bind(delta.calls)
    .bind(delta.tokens)
    .bind(delta.cost_microcents)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    Ok(fetch_summary(conn, user_id, period)
        .await?
        .unwrap_or_else(|| UsageSummary::empty(user_id, period)))
}

#[async_trait]
impl UsageSummaryRepo for SqliteUsageSummaryRepo {
    async fn increment(
        &self,
        user_id: &str,
        period: BillingPeriod,
        delta: &UsageDelta,
        at: DateTime<Utc>,
    ) -> DbResult<UsageSummary> {
        let mut tx = self.pool.begin().await?;
        let summary = add_usage(&mut tx, user_id, period, delta, at).await?;
        tx.commit().await?;

        Ok(summary)
    }

    async fn record(
        &self,
        delta: &UsageDelta,
        entry: NewAuditLogEntry,
    ) -> DbResult<(UsageSummary, AuditLogEntry)> {
        let mut tx = self.pool.begin().await?;
        let summary = add_usage(
            &mut tx,
            &entry.user_id,
            entry.billing_period,
            delta,
            entry.occurred_at,
        )
        .await?;
        let logged = insert_entry(&mut tx, entry).await?;
        tx.commit().await?;

        Ok((summary, logged))
    }

    async fn get(&self, user_id: &str, period: BillingPeriod) -> DbResult<Option<UsageSummary>> {
        let mut conn = self.pool.acquire().await?;
        fetch_summary(&mut conn, user_id, period).await
    }

    async fn get_or_create(
        &self,
        user_id: &str,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> DbResult<UsageSummary> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_summaries (user_id, billing_period, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(period.to_string())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(fetch_summary(&mut conn, user_id, period)
            .await?
            .unwrap_or_else(|| UsageSummary::empty(user_id, period)))
    }

    async fn reset(
        &self,
        user_id: &str,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let existed = reset_counters(&mut tx, user_id, period, now).await?;
        tx.commit().await?;
        Ok(existed)
    }

    async fn escalate_status(
        &self,
        user_id: &str,
        period: BillingPeriod,
        status: UsageStatus,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE usage_summaries
            SET status = ?
            WHERE user_id = ? AND billing_period = ?
              AND (CASE status WHEN 'active' THEN 0 WHEN 'warning' THEN 1 ELSE 2 END) < ?
            "#,
        )
        .bind(status.as_str())
        .bind(user_id)
        .bind(period.to_string())
        .bind(status.rank())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_range(
        &self,
        user_id: &str,
        from: BillingPeriod,
        to: BillingPeriod,
    ) -> DbResult<Vec<UsageSummary>> {
        let from = from.to_string();
        let to = to.to_string();

        let rows = sqlx::query(
            r#"
            SELECT billing_period, total_calls, total_tokens, total_cost_microcents, status, updated_at
            FROM usage_summaries
            WHERE user_id = ? AND billing_period >= ? AND billing_period <= ?
            ORDER BY billing_period ASC
            "#,
        )
        .bind(user_id)
        .bind(&from)
        .bind(&to)
        .fetch_all(&self.pool)
        .await?;

        let provider_rows = sqlx::query(
            r#"
            SELECT billing_period, provider, calls, tokens, cost_microcents
            FROM usage_provider_counters
            WHERE user_id = ? AND billing_period >= ? AND billing_period <= ?
            ORDER BY billing_period ASC, provider ASC
            "#,
        )
        .bind(user_id)
        .bind(&from)
        .bind(&to)
        .fetch_all(&self.pool)
        .await?;

        let mut providers: BTreeMap<String, Vec<ProviderUsage>> = BTreeMap::new();
        for row in &provider_rows {
            providers
                .entry(row.get("billing_period"))
                .or_default()
                .push(Self::provider_from_row(row));
        }

        rows.iter()
            .map(|row| {
                let period: String = row.get("billing_period");
                let counters = providers.remove(&period).unwrap_or_default();
                Self::summary_from_row(user_id, row, counters)
            })
            .collect()
    }
}
