//! Operation Orchestrator
//!
//! Multi-ledger workflow engine for the reserve rail. No single ledger can
//! express "do A, B and C, or none of them", so every deposit, withdrawal
//! and exchange runs as a saga: ordered steps against the custody ledger,
//! the token ledgers and the compliance registry, with a recorded
//! compensation for each mutating step.
//!
//! # Workflows
//!
//! | Kind | Steps |
//! |---|---|
//! | Deposit | compliance, external validation, reserve registration, mint, audit |
//! | Withdrawal | compliance, balance validation, burn, reserve processing, external release, audit |
//! | Exchange | compliance (both parties), rate resolution, source debit, destination credit, fee, audit |
//!
//! # Example
//!
//! ```no_run
//! # use orchestrator::{Orchestrator, OperationRequest, OperationParams};
//! # use reserve_core::AccountId;
//! # use rust_decimal::Decimal;
//! # use std::sync::Arc;
//! # async fn example(orchestrator: Arc<Orchestrator>) -> reserve_core::Result<()> {
//! let id = orchestrator
//!     .submit(OperationRequest::new(
//!         AccountId::new("alice"),
//!         OperationParams::Deposit {
//!             amount: Decimal::from(100_000_000u64),
//!             external_reference: "btc-tx-9f2c".into(),
//!             confirmations: 6,
//!         },
//!     ))
//!     .await?;
//! let record = orchestrator
//!     .wait_for_completion(&id, std::time::Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod record;
pub mod service;
pub mod store;

// Re-exports
pub use executor::{Collaborators, StepEffect, StepExecutor};
pub use orchestrator::{CancelOutcome, Orchestrator};
pub use plan::{workflow, Step};
pub use record::{Compensation, OperationParams, OperationRecord, OperationRequest, StepOutcome};
pub use service::{
    AcknowledgeRequest, ApiError, ApiResult, HaltStatus, ReserveService, SubmitResponse,
    Versioned, API_VERSION,
};
pub use store::{Admission, InMemoryStore, OperationStore};

#[cfg(feature = "rocksdb")]
pub use store::RocksDbStore;
