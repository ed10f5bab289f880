use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::common::{parse_column, parse_uuid};
use crate::{
    db::{error::DbResult, repos::RenewalHistoryRepo},
    models::{
        NewRenewalRecord, PaymentMetadata, RenewalHistoryRecord, RetentionStats, RetentionTier,
        UsageSnapshot,
    },
};

const RECORD_COLUMNS: &str = "\
    id, user_id, subscription_id, plan_id, previous_plan_id, renewal_type, \
    previous_period_start, previous_period_end, new_period_start, new_period_end, \
    usage_before_renewal, retention_tier, payment_amount_microcents, payment_currency, \
    payment_reference, created_at";

pub struct SqliteRenewalHistoryRepo {
    pool: SqlitePool,
}

impl SqliteRenewalHistoryRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> DbResult<RenewalHistoryRecord> {
        let snapshot: Option<String> = row.get("usage_before_renewal");

        Ok(RenewalHistoryRecord {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            user_id: row.get("user_id"),
            subscription_id: parse_uuid(&row.get::<String, _>("subscription_id"))?,
            plan_id: row.get("plan_id"),
            previous_plan_id: row.get("previous_plan_id"),
            renewal_type: parse_column(&row.get::<String, _>("renewal_type"))?,
            previous_period_start: row.get("previous_period_start"),
            previous_period_end: row.get("previous_period_end"),
            new_period_start: row.get("new_period_start"),
            new_period_end: row.get("new_period_end"),
            usage_before_renewal: snapshot
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
            retention_tier: parse_column(&row.get::<String, _>("retention_tier"))?,
            payment: PaymentMetadata {
                amount_microcents: row.get("payment_amount_microcents"),
                currency: row.get("payment_currency"),
                reference: row.get("payment_reference"),
            },
            created_at: row.get("created_at"),
        })
    }
}

/// Insert a history record on an open connection.
pub(super) async fn insert_record(
    conn: &mut SqliteConnection,
    record: NewRenewalRecord,
) -> DbResult<RenewalHistoryRecord> {
    let id = Uuid::new_v4();
    let snapshot_json = record
        .usage_before_renewal
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO renewal_history (
            id, user_id, subscription_id, plan_id, previous_plan_id, renewal_type,
            previous_period_start, previous_period_end, new_period_start, new_period_end,
            usage_before_renewal, retention_tier, payment_amount_microcents,
            payment_currency, payment_reference, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'full', ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(&record.user_id)
    .bind(record.subscription_id.to_string())
    .bind(&record.plan_id)
    .bind(&record.previous_plan_id)
    .bind(record.renewal_type.as_str())
    .bind(record.previous_period_start)
    .bind(record.previous_period_end)
    .bind(record.new_period_start)
    .bind(record.new_period_end)
    .bind(&snapshot_json)
    .bind(record.payment.amount_microcents)
    .bind(&record.payment.currency)
    .bind(&record.payment.reference)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(RenewalHistoryRecord {
        id,
        user_id: record.user_id,
        subscription_id: record.subscription_id,
        plan_id: record.plan_id,
        previous_plan_id: record.previous_plan_id,
        renewal_type: record.renewal_type,
        previous_period_start: record.previous_period_start,
        previous_period_end: record.previous_period_end,
        new_period_start: record.new_period_start,
        new_period_end: record.new_period_end,
        usage_before_renewal: record.usage_before_renewal,
        retention_tier: RetentionTier::Full,
        payment: record.payment,
        created_at: record.created_at,
    })
}

#[async_trait]
impl RenewalHistoryRepo for SqliteRenewalHistoryRepo {
    async fn create(&self, record: NewRenewalRecord) -> DbResult<RenewalHistoryRecord> {
        let mut conn = self.pool.acquire().await?;
        insert_record(&mut conn, record).await
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<RenewalHistoryRecord>> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM renewal_history WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> DbResult<Vec<RenewalHistoryRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM renewal_history \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn list_for_retention(
        &self,
        user_id: Option<&str>,
        created_before: DateTime<Utc>,
        below: RetentionTier,
        limit: i64,
    ) -> DbResult<Vec<RenewalHistoryRecord>> {
        let tiers: Vec<RetentionTier> = RetentionTier::ALL
            .into_iter()
            .filter(|tier| *tier < below)
            .collect();
        if tiers.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; tiers.len()].join(", ");
        let user_filter = if user_id.is_some() {
            "AND user_id = ?"
        } else {
            ""
        };
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM renewal_history \
             WHERE retention_tier IN ({placeholders}) AND created_at < ? {user_filter} \
             ORDER BY created_at ASC LIMIT ?"
        );

        let mut select = sqlx::query(&query);
        for tier in &tiers {
            select = select.bind(tier.as_str());
        }
        select = select.bind(created_before);
        if let Some(user_id) = user_id {
            select = select.bind(user_id);
        }
        let rows = select.bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn update_retention(
        &self,
        id: Uuid,
        from: RetentionTier,
        to: RetentionTier,
        snapshot: Option<&UsageSnapshot>,
    ) -> DbResult<bool> {
        let snapshot_json = snapshot.map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE renewal_history
            SET retention_tier = ?, usage_before_renewal = ?
            WHERE id = ? AND retention_tier = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&snapshot_json)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_tier(&self, user_id: Option<&str>) -> DbResult<RetentionStats> {
        let user_filter = if user_id.is_some() {
            "WHERE user_id = ?"
        } else {
            ""
        };
        let query = format!(
            "SELECT retention_tier, COUNT(*) as count FROM renewal_history \
             {user_filter} GROUP BY retention_tier"
        );

        let mut select = sqlx::query(&query);
        if let Some(user_id) = user_id {
            select = select.bind(user_id);
        }
        let rows = select.fetch_all(&self.pool).await?;

        let mut stats = RetentionStats::default();
        for row in &rows {
            let tier: RetentionTier = parse_column(&row.get::<String, _>("retention_tier"))?;
            stats.add(tier, row.get("count"));
        }
        Ok(stats)
    }
}
