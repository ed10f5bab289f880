use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{
    common::{parse_column, parse_uuid},
    renewals::insert_record,
    usage::{fetch_summary, reset_counters},
};
use crate::{
    db::{
        error::DbResult,
        repos::{RenewalCommit, SubscriptionRepo},
    },
    models::{RenewalHistoryRecord, SubscriptionStatus, UsageSnapshot, UserSubscription},
};

pub struct SqliteSubscriptionRepo {
    pool: SqlitePool,
}

impl SqliteSubscriptionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn subscription_from_row(row: &sqlx::sqlite::SqliteRow) -> DbResult<UserSubscription> {
        Ok(UserSubscription {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            user_id: row.get("user_id"),
            plan_id: row.get("plan_id"),
            billing_cycle: parse_column(&row.get::<String, _>("billing_cycle"))?,
            current_period_start: row.get("current_period_start"),
            current_period_end: row.get("current_period_end"),
            status: parse_column(&row.get::<String, _>("status"))?,
            auto_renew: row.get("auto_renew"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SubscriptionRepo for SqliteSubscriptionRepo {
    async fn get_by_user(&self, user_id: &str) -> DbResult<Option<UserSubscription>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, plan_id, billing_cycle, current_period_start,
                   current_period_end, status, auto_renew, created_at, updated_at
            FROM user_subscriptions
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::subscription_from_row).transpose()
    }

    async fn commit_renewal(
        &self,
        commit: RenewalCommit,
    ) -> DbResult<Option<RenewalHistoryRecord>> {
        let RenewalCommit {
            subscription: sub,
            expected_period_end,
            mut history,
            usage_period,
        } = commit;

        // The subscription write comes first so the transaction holds the
        // write lock before the usage snapshot is read.
        let mut tx = self.pool.begin().await?;

        match expected_period_end {
            Some(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE user_subscriptions
                    SET plan_id = ?, billing_cycle = ?, current_period_start = ?,
                        current_period_end = ?, status = ?, auto_renew = ?, updated_at = ?
                    WHERE id = ? AND current_period_end = ?
                    "#,
                )
                .bind(&sub.plan_id)
                .bind(sub.billing_cycle.as_str())
                .bind(sub.current_period_start)
                .bind(sub.current_period_end)
                .bind(sub.status.as_str())
                .bind(sub.auto_renew)
                .bind(sub.updated_at)
                .bind(sub.id.to_string())
                .bind(expected)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Ok(None);
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO user_subscriptions (
                        id, user_id, plan_id, billing_cycle, current_period_start,
                        current_period_end, status, auto_renew, created_at, updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (user_id) DO UPDATE SET
                        plan_id = excluded.plan_id,
                        billing_cycle = excluded.billing_cycle,
                        current_period_start = excluded.current_period_start,
                        current_period_end = excluded.current_period_end,
                        status = excluded.status,
                        auto_renew = excluded.auto_renew,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(sub.id.to_string())
                .bind(&sub.user_id)
                .bind(&sub.plan_id)
                .bind(sub.billing_cycle.as_str())
                .bind(sub.current_period_start)
                .bind(sub.current_period_end)
                .bind(sub.status.as_str())
                .bind(sub.auto_renew)
                .bind(sub.created_at)
                .bind(sub.updated_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        let before = fetch_summary(&mut tx, &sub.user_id, usage_period).await?;
        history.usage_before_renewal = before.as_ref().map(UsageSnapshot::from);

        let record = insert_record(&mut tx, history).await?;
        reset_counters(&mut tx, &sub.user_id, usage_period, sub.updated_at).await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn expire(
        &self,
        id: Uuid,
        expected_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = ?, updated_at = ?
            WHERE id = ? AND current_period_end = ? AND status = ?
            "#,
        )
        .bind(SubscriptionStatus::Expired.as_str())
        .bind(now)
        .bind(id.to_string())
        .bind(expected_period_end)
        .bind(SubscriptionStatus::Active.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
