use thiserror::Error;

/// Storage failures. Missing rows are `Ok(None)` from the repositories, not
/// an error.
#[derive(Debug, Error)]
pub enum DbError {
    /// A conditional write lost to a concurrent one: the stored period
    /// boundary or compaction cursor moved underneath it.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The database was migrated by a different build than this one.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersion { expected: i64, found: i64 },

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Aggregate details or usage snapshots that failed to (de)serialize.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored column holds a value no build ever wrote.
    #[error("Corrupt row: {0}")]
    Internal(String),
}

pub type DbResult<T> = Result<T, DbError>;
