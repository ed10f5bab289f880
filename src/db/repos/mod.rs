mod alerts;
mod audit_logs;
mod plans;
mod renewals;
mod subscriptions;
mod usage;

pub use alerts::*;
pub use audit_logs::*;
pub use plans::*;
pub use renewals::*;
pub use subscriptions::*;
pub use usage::*;
