use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::{
    db::{error::DbResult, repos::PlanRepo},
    models::{ProviderLimit, SubscriptionPlan, UsageLimit},
};

pub struct SqlitePlanRepo {
    pool: SqlitePool,
}

impl SqlitePlanRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn limit_from_row(row: &sqlx::sqlite::SqliteRow) -> ProviderLimit {
        ProviderLimit {
            provider: row.get("provider"),
            max_calls: UsageLimit::from_stored(row.get("max_calls")),
            max_tokens: UsageLimit::from_stored(row.get("max_tokens")),
        }
    }

    fn plan_from_row(row: &sqlx::sqlite::SqliteRow, limits: Vec<ProviderLimit>) -> SubscriptionPlan {
        SubscriptionPlan {
            id: row.get("id"),
            name: row.get("name"),
            tier_rank: row.get("tier_rank"),
            monthly_cost_ceiling: UsageLimit::from_stored(row.get("monthly_cost_ceiling_microcents")),
            limits,
        }
    }
}

#[async_trait]
impl PlanRepo for SqlitePlanRepo {
    async fn upsert(&self, plan: &SubscriptionPlan, now: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_plans (
                id, name, tier_rank, monthly_cost_ceiling_microcents, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                tier_rank = excluded.tier_rank,
                monthly_cost_ceiling_microcents = excluded.monthly_cost_ceiling_microcents,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(plan.tier_rank)
        .bind(plan.monthly_cost_ceiling.to_stored())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM plan_limits WHERE plan_id = ?")
            .bind(&plan.id)
            .execute(&mut *tx)
            .await?;

        for limit in &plan.limits {
            sqlx::query(
                r#"
                INSERT INTO plan_limits (plan_id, provider, max_calls, max_tokens)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&plan.id)
            .bind(&limit.provider)
            .bind(limit.max_calls.to_stored())
            .bind(limit.max_tokens.to_stored())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DbResult<Option<SubscriptionPlan>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, tier_rank, monthly_cost_ceiling_microcents
            FROM subscription_plans
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let limits = sqlx::query(
            r#"
            SELECT provider, max_calls, max_tokens
            FROM plan_limits
            WHERE plan_id = ?
            ORDER BY provider
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::limit_from_row)
        .collect();

        Ok(Some(Self::plan_from_row(&row, limits)))
    }

    async fn list(&self) -> DbResult<Vec<SubscriptionPlan>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, tier_rank, monthly_cost_ceiling_microcents
            FROM subscription_plans
            ORDER BY tier_rank ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let limit_rows = sqlx::query(
            "SELECT plan_id, provider, max_calls, max_tokens FROM plan_limits ORDER BY provider",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut limits: HashMap<String, Vec<ProviderLimit>> = HashMap::new();
        for row in &limit_rows {
            limits
                .entry(row.get("plan_id"))
                .or_default()
                .push(Self::limit_from_row(row));
        }

        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                let plan_limits = limits.remove(&id).unwrap_or_default();
                Self::plan_from_row(row, plan_limits)
            })
            .collect())
    }
}
