use thiserror::Error;

use crate::{
    db::DbError, events::HookError, models::InvalidPeriod, pricing::PricingError,
    rate_limit::RateLimitError,
};

/// Errors returned by the metering engine.
#[derive(Debug, Error)]
pub enum MeterError {
    /// Malformed input: bad period, unknown provider, negative delta.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A user tried to act on another user's record.
    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The database schema is not the one this build expects.
    #[error("Database schema error: expected version {expected}, found {found}")]
    DatabaseSchema { expected: i64, found: i64 },

    /// A collaborator failed during a subscription change. Nothing was written.
    #[error("External service error: {message}")]
    ExternalService {
        message: String,
        retry_suggested: bool,
    },

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("Database error: {0}")]
    Database(DbError),
}

impl MeterError {
    /// Whether the same call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeterError::ExternalService {
                retry_suggested, ..
            } => *retry_suggested,
            MeterError::RateLimited(_) => true,
            MeterError::Database(DbError::Conflict(_)) => true,
            _ => false,
        }
    }
}

impl From<DbError> for MeterError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::SchemaVersion { expected, found } => {
                MeterError::DatabaseSchema { expected, found }
            }
            other => MeterError::Database(other),
        }
    }
}

impl From<InvalidPeriod> for MeterError {
    fn from(err: InvalidPeriod) -> Self {
        MeterError::Validation(err.to_string())
    }
}

impl From<PricingError> for MeterError {
    fn from(err: PricingError) -> Self {
        MeterError::Validation(err.to_string())
    }
}

impl From<HookError> for MeterError {
    fn from(err: HookError) -> Self {
        MeterError::ExternalService {
            message: err.message,
            retry_suggested: err.retry_suggested,
        }
    }
}

pub type MeterResult<T> = Result<T, MeterError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_schema_version_maps_to_schema_error() {
        let err: MeterError = DbError::SchemaVersion {
            expected: 2,
            found: 1,
        }
        .into();
        assert!(matches!(
            err,
            MeterError::DatabaseSchema {
                expected: 2,
                found: 1
            }
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_hook_error_keeps_retry_flag() {
        let err: MeterError = HookError::retryable("payment provider timeout").into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "External service error: payment provider timeout");

        let err: MeterError = HookError::permanent("card declined").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        let err: MeterError = RateLimitError {
            action: "check_limits".to_string(),
            limit: 5,
            window: Duration::from_secs(60),
            retry_after: Duration::from_secs(12),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_is_final() {
        assert!(!MeterError::Validation("bad period".into()).is_retryable());
        assert!(!MeterError::NotFound("plan".into()).is_retryable());
    }
}
