use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::common::{parse_column, parse_period, parse_uuid};
use crate::{
    db::{error::DbResult, repos::AlertRepo},
    models::{NewUsageAlert, UsageAlert},
};

const ALERT_COLUMNS: &str = "\
    id, user_id, billing_period, provider, kind, percent_used, message, is_read, created_at";

pub struct SqliteAlertRepo {
    pool: SqlitePool,
}

impl SqliteAlertRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> DbResult<UsageAlert> {
        Ok(UsageAlert {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            user_id: row.get("user_id"),
            billing_period: parse_period(&row.get::<String, _>("billing_period"))?,
            provider: row.get("provider"),
            kind: parse_column(&row.get::<String, _>("kind"))?,
            percent_used: row.get::<i64, _>("percent_used").clamp(0, u32::MAX as i64) as u32,
            message: row.get("message"),
            is_read: row.get("is_read"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl AlertRepo for SqliteAlertRepo {
    async fn create(&self, alert: NewUsageAlert) -> DbResult<Option<UsageAlert>> {
        let id = Uuid::new_v4();

        // The unique index on (user, period, provider, kind) makes repeats a no-op
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_alerts (
                id, user_id, billing_period, provider, kind, percent_used,
                message, is_read, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&alert.user_id)
        .bind(alert.billing_period.to_string())
        .bind(&alert.provider)
        .bind(alert.kind.as_str())
        .bind(alert.percent_used as i64)
        .bind(&alert.message)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(UsageAlert {
            id,
            user_id: alert.user_id,
            billing_period: alert.billing_period,
            provider: alert.provider,
            kind: alert.kind,
            percent_used: alert.percent_used,
            message: alert.message,
            is_read: false,
            created_at: alert.created_at,
        }))
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<UsageAlert>> {
        let query = format!("SELECT {ALERT_COLUMNS} FROM usage_alerts WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::alert_from_row).transpose()
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> DbResult<Vec<UsageAlert>> {
        let unread_filter = if unread_only { "AND is_read = 0" } else { "" };
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM usage_alerts \
             WHERE user_id = ? {unread_filter} ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::alert_from_row).collect()
    }

    async fn count_unread(&self, user_id: &str) -> DbResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM usage_alerts WHERE user_id = ? AND is_read = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("count"))
    }

    async fn mark_read(&self, id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("UPDATE usage_alerts SET is_read = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
