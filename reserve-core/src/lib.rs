//! Reserve Rail Core
//!
//! Shared vocabulary for the custody-backed token rail: identifiers, the
//! error taxonomy, configuration, retry/timeout policy, the event bus and the
//! contracts of the external ledgers the orchestrator drives.
//!
//! # Collaborators
//!
//! - **Compliance registry**: tier, standing and approval lookups
//! - **Token ledger**: mint/burn/balance for one token asset
//! - **Custody ledger**: deposit registration, withdrawal processing, totals, proofs
//! - **Price oracle**: asset pair rates with an as-of timestamp
//!
//! In-memory simulators of all four live in [`mock`].

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod mock;
pub mod retry;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{ComplianceRegistry, CustodyLedger, PriceOracle, TokenLedger};
pub use config::Config;
pub use error::{DenialReason, Error, ErrorClass, Result};
pub use events::{Event, EventBus};
pub use metrics::Metrics;
pub use retry::{RetryOutcome, RetryPolicy};
pub use types::*;
