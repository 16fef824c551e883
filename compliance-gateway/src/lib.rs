//! Compliance Gateway
//!
//! Answers "is this (account, category, amount) allowed right now" against
//! the external compliance registry and the tiered rolling usage windows.
//!
//! # Features
//!
//! - Four tiers with daily and monthly ceilings per category
//! - Rolling 24h/30d windows opened on first use, reset lazily
//! - Atomic check-and-increment per (account, category)
//! - Warning events past 80% of a ceiling
//! - Enhanced verification above the large-transaction threshold
//! - Deny-by-default on registry outage, with an explicit fail-open override

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod gateway;
pub mod limits;
pub mod window;

// Re-exports
pub use gateway::{BatchDecision, CategoryUsage, CheckRequest, ComplianceGateway, Decision, UsageReport};
pub use limits::LimitTable;
pub use window::{Allocation, ComplianceWindow, RollingCounter, WindowBook, WindowUsage};
