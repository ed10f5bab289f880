//! Usage metering and billing-period lifecycle engine.
//!
//! Tracks per-user usage of external providers against subscription plans,
//! moves subscriptions through their billing periods, and keeps the usage
//! audit log and renewal history bounded. [`MeterEngine`] is the entry point.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod observability;
pub mod pricing;
pub mod rate_limit;
pub mod services;

pub use config::MeterConfig;
pub use engine::{Dashboard, MeterEngine, PeriodReset, RecordedUsage, ResetReason, SweepReport};
pub use error::{MeterError, MeterResult};
