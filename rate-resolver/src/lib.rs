//! Exchange Rate Resolver
//!
//! Prices token swaps from an external oracle. Oracle rates are validated
//! for staleness and deviation before acceptance; rejected or missing rates
//! fall back to the last accepted (or seeded) rate at a higher fee.
//!
//! # Pricing
//!
//! - `gross = amount × rate × (1 − impact)`, rounded toward zero
//! - `fee = gross × fee_bps`, rounded away from zero
//! - `amount_out = gross − fee`
//! - `min_amount_out = amount_out × (1 − slippage_tolerance)`

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod impact;
pub mod quote;
pub mod resolver;

// Re-exports
pub use impact::PriceImpact;
pub use quote::{FallbackReason, Quote, RateSource};
pub use resolver::RateResolver;

/// Basis points in one whole
pub const BPS_SCALE: u32 = 10_000;
