//! Reserve Reconciliation
//!
//! Compares custody holdings against issued token supply, raises
//! discrepancy alerts and trips the process-wide halt flag. Also hosts the
//! proof-of-reserves scheduler.
//!
//! # Thresholds
//!
//! `discrepancy_pct = |custody − issued| / issued × 100`
//!
//! | Discrepancy | Status | Severity |
//! |---|---|---|
//! | ≤ tolerance (1%) | Consistent | none |
//! | ≤ warning (2%) | MinorDiscrepancy | Minor |
//! | ≤ critical (3%) | MinorDiscrepancy | Warning |
//! | ≤ halt (5%) | MinorDiscrepancy | Critical |
//! | > halt | Halted | Emergency |

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod alerts;
pub mod engine;
pub mod halt;
pub mod history;
pub mod proof;
pub mod threshold;

// Re-exports
pub use alerts::{AlertBook, DiscrepancyAlert, ProtectiveMeasure};
pub use engine::{CheckTrigger, ReconciliationEngine, ReconciliationResult};
pub use halt::{HaltState, HaltSwitch};
pub use history::BoundedHistory;
pub use proof::{ProofScheduler, ProofStatus, ReserveProofRecord, VerificationOutcome};
pub use threshold::{Assessment, Thresholds};
