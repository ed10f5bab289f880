use std::str::FromStr;

use uuid::Uuid;

use crate::{
    db::error::{DbError, DbResult},
    models::BillingPeriod,
};

/// Parse a UUID string from the database, returning a DbError on failure
pub fn parse_uuid(s: &str) -> DbResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DbError::Internal(format!("Invalid UUID in database: {}", e)))
}

/// Parse a stored enum column through its `FromStr` impl
pub fn parse_column<T>(s: &str) -> DbResult<T>
where
    T: FromStr<Err = String>,
{
    s.parse().map_err(DbError::Internal)
}

pub fn parse_period(s: &str) -> DbResult<BillingPeriod> {
    s.parse()
        .map_err(|e| DbError::Internal(format!("Invalid billing period in database: {}", e)))
}
