mod error;
pub mod repos;
pub mod sqlite;

#[cfg(test)]
pub mod tests;

use std::{str::FromStr, sync::Arc, time::Duration};

pub use error::{DbError, DbResult};
pub use repos::*;
use sqlx::{
    Row,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};

use crate::config::DatabaseConfig;

/// Migrations embedded at build time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations_sqlx/sqlite");

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    usage: Arc<dyn UsageSummaryRepo>,
    audit_logs: Arc<dyn AuditLogRepo>,
    plans: Arc<dyn PlanRepo>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    renewals: Arc<dyn RenewalHistoryRepo>,
    alerts: Arc<dyn AlertRepo>,
}

/// SQLite database pool.
///
/// Repositories are cached at construction time to avoid allocation on each access.
pub struct DbPool {
    pool: SqlitePool,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    pub fn from_sqlite(pool: SqlitePool) -> Self {
        let repos = CachedRepos {
            usage: Arc::new(sqlite::SqliteUsageSummaryRepo::new(pool.clone())),
            audit_logs: Arc::new(sqlite::SqliteAuditLogRepo::new(pool.clone())),
            plans: Arc::new(sqlite::SqlitePlanRepo::new(pool.clone())),
            subscriptions: Arc::new(sqlite::SqliteSubscriptionRepo::new(pool.clone())),
            renewals: Arc::new(sqlite::SqliteRenewalHistoryRepo::new(pool.clone())),
            alerts: Arc::new(sqlite::SqliteAlertRepo::new(pool.clone())),
        };
        DbPool { pool, repos }
    }

    /// Create a database pool from configuration
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let pool = if config.is_in_memory() {
            // An in-memory database lives as long as its connection
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(
                    SqliteConnectOptions::from_str("sqlite::memory:")?.busy_timeout(busy_timeout),
                )
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(
                    SqliteConnectOptions::new()
                        .filename(&config.path)
                        .create_if_missing(config.create_if_missing)
                        .journal_mode(if config.wal_mode {
                            SqliteJournalMode::Wal
                        } else {
                            SqliteJournalMode::Delete
                        })
                        .busy_timeout(busy_timeout),
                )
                .await?
        };

        tracing::debug!(
            path = %config.path,
            max_connections = config.max_connections,
            "Opened SQLite database"
        );

        Ok(Self::from_sqlite(pool))
    }

    /// Run database migrations using sqlx's migration runner
    /// This automatically creates and manages a _sqlx_migrations table
    pub async fn run_migrations(&self) -> DbResult<()> {
        tracing::info!("Running SQLite migrations");
        MIGRATOR.run(&self.pool).await?;
        tracing::info!("SQLite migrations completed successfully");
        Ok(())
    }

    /// Newest migration version embedded in this build.
    pub fn expected_schema_version() -> i64 {
        MIGRATOR.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Newest successfully applied migration, 0 for a fresh database.
    pub async fn applied_schema_version(&self) -> DbResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
        )
        .fetch_one(&self.pool)
        .await?;
        if row.get::<i64, _>("count") == 0 {
            return Ok(0);
        }

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) as version FROM _sqlx_migrations WHERE success = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("version"))
    }

    /// Fail with [`DbError::SchemaVersion`] unless the database is at exactly
    /// the schema this build was compiled against.
    pub async fn check_schema_version(&self) -> DbResult<()> {
        let expected = Self::expected_schema_version();
        let found = self.applied_schema_version().await?;
        if found != expected {
            return Err(DbError::SchemaVersion { expected, found });
        }
        Ok(())
    }

    /// Close every connection in the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get usage summary repository
    pub fn usage(&self) -> Arc<dyn UsageSummaryRepo> {
        Arc::clone(&self.repos.usage)
    }

    /// Get usage audit log repository
    pub fn audit_logs(&self) -> Arc<dyn AuditLogRepo> {
        Arc::clone(&self.repos.audit_logs)
    }

    /// Get subscription plan repository
    pub fn plans(&self) -> Arc<dyn PlanRepo> {
        Arc::clone(&self.repos.plans)
    }

    /// Get user subscription repository
    pub fn subscriptions(&self) -> Arc<dyn SubscriptionRepo> {
        Arc::clone(&self.repos.subscriptions)
    }

    /// Get renewal history repository
    pub fn renewals(&self) -> Arc<dyn RenewalHistoryRepo> {
        Arc::clone(&self.repos.renewals)
    }

    /// Get usage alert repository
    pub fn alerts(&self) -> Arc<dyn AlertRepo> {
        Arc::clone(&self.repos.alerts)
    }
}
