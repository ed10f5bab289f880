//! Shared database repository test infrastructure
//!
//! Each repository has a test module (e.g., `usage.rs`) containing shared
//! test functions that take `&dyn XxxRepo` (or a context of several repos),
//! and a `sqlite_tests` module that runs them against an in-memory database
//! with the real migrations applied.

mod audit_logs;
pub mod harness;
mod renewals;
