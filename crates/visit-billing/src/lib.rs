//! Billing core for visiting-nursing operations.
//!
//! Turns a month of visit records into a monthly receipt under medical and
//! long-term-care insurance point rules, and carries that receipt through its
//! confirm / reopen / send lifecycle.

pub mod billing;
pub mod config;
pub mod error;
pub mod telemetry;
