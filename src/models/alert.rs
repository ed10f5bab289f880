use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BillingPeriod, UsageStatus};

/// Threshold an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Warning,
    Exceeded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Warning => "warning",
            AlertKind::Exceeded => "exceeded",
        }
    }

    /// Summary status reached when this alert fires.
    pub fn status(&self) -> UsageStatus {
        match self {
            AlertKind::Warning => UsageStatus::Warning,
            AlertKind::Exceeded => UsageStatus::Exceeded,
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(AlertKind::Warning),
            "exceeded" => Ok(AlertKind::Exceeded),
            _ => Err(format!("Invalid alert kind: {}", s)),
        }
    }
}

/// Notification that a user's usage crossed a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAlert {
    pub id: Uuid,
    pub user_id: String,
    pub billing_period: BillingPeriod,
    /// Provider whose limit was crossed, `None` for the cost ceiling.
    pub provider: Option<String>,
    pub kind: AlertKind,
    /// Percentage of the limit in use when the alert fired.
    pub percent_used: u32,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an alert.
#[derive(Debug, Clone)]
pub struct NewUsageAlert {
    pub user_id: String,
    pub billing_period: BillingPeriod,
    pub provider: Option<String>,
    pub kind: AlertKind,
    pub percent_used: u32,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
