//! Volume bot: paced BUY-then-SELL futures cycles against a notional
//! volume budget.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod commands;
pub mod config;
pub mod engine;
pub mod exchanges;
pub mod types;
