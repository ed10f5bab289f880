mod alert;
mod audit_log;
mod period;
mod plan;
mod renewal;
mod subscription;
mod usage;

pub use alert::*;
pub use audit_log::*;
pub use period::*;
pub use plan::*;
pub use renewal::*;
pub use subscription::*;
pub use usage::*;
