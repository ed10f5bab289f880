//! Engine services, one per component.
//!
//! Each service owns an `Arc<DbPool>` and is cheap to clone or share; the
//! [`MeterEngine`](crate::engine::MeterEngine) wires them together.

mod alerts;
mod billing_period;
mod compaction;
mod limits;
mod locks;
mod retention;
mod usage_counters;

pub use alerts::AlertService;
pub use billing_period::{
    AdvanceOutcome, BillingPeriodManager, Rollover, SubscribeRequest, SubscriptionChange,
};
pub use compaction::LogCompactor;
pub use limits::{LimitCheck, LimitDetails, LimitEnforcer, LimitMetric};
pub use locks::UserLocks;
pub use retention::{RetentionRunResult, RetentionTierManager};
pub(crate) use usage_counters::ensure_user;
pub use usage_counters::{MAX_TREND_MONTHS, UsageCounterStore};
