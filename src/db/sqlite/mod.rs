mod alerts;
mod audit_logs;
mod common;
mod plans;
mod renewals;
mod subscriptions;
mod usage;

pub use alerts::SqliteAlertRepo;
pub use audit_logs::SqliteAuditLogRepo;
pub use plans::SqlitePlanRepo;
pub use renewals::SqliteRenewalHistoryRepo;
pub use subscriptions::SqliteSubscriptionRepo;
pub use usage::SqliteUsageSummaryRepo;
