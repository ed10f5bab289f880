use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SubscriptionPlan;

/// Length of a subscription period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            BillingCycle::Monthly => Duration::days(30),
            BillingCycle::Yearly => Duration::days(365),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" | "annual" => Ok(BillingCycle::Yearly),
            _ => Err(format!("Invalid billing cycle: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    /// Period ended without auto-renew; usage is denied until the user subscribes again.
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// A user's subscription. At most one row exists per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubscription {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub auto_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSubscription {
    /// A fresh active subscription whose first period starts at `now`.
    pub fn start(
        user_id: &str,
        plan_id: &str,
        billing_cycle: BillingCycle,
        auto_renew: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            billing_cycle,
            current_period_start: now,
            current_period_end: now + billing_cycle.length(),
            status: SubscriptionStatus::Active,
            auto_renew,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_period_over(&self, now: DateTime<Utc>) -> bool {
        now > self.current_period_end
    }

    /// Period bounds after rolling forward from the stored end until `now`
    /// falls inside the period. Always derived from the stored boundary, so
    /// every caller computes the same result for the same row.
    pub fn next_period_covering(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let length = self.billing_cycle.length();
        let mut start = self.current_period_start;
        let mut end = self.current_period_end;
        while now > end {
            start = end;
            end += length;
        }
        (start, end)
    }
}

/// The subscription in force for a user together with its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSubscription {
    /// `None` when the user has never subscribed and runs on the free plan.
    pub subscription: Option<UserSubscription>,
    pub plan: SubscriptionPlan,
}

impl ResolvedSubscription {
    pub fn is_synthesized(&self) -> bool {
        self.subscription.is_none()
    }

    pub fn is_expired(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|s| s.status == SubscriptionStatus::Expired)
    }
}
