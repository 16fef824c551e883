//! Workflow plans
//!
//! Each workflow kind expands into a fixed, ordered list of steps. One
//! generic driver walks the list; the steps differ only in which
//! collaborator call they make and which compensation they leave behind.

use reserve_core::{OperationKind, OperationStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One gated step of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Compliance gateway check-and-charge
    ComplianceCheck,
    /// Confirm the external transfer is final
    ValidateExternal,
    /// Register the deposit with custody
    RegisterReserve,
    /// Mint the reserve token to the depositor
    Mint,
    /// Confirm the token balance covers the withdrawal
    ValidateBalance,
    /// Burn the reserve token
    Burn,
    /// Custody withdrawal processing
    ProcessReserve,
    /// Release the off-ledger transfer
    InitiateExternal,
    /// Price the swap
    ResolveRate,
    /// Burn the sold asset from the account
    DebitSource,
    /// Mint the bought asset to the destination
    CreditDestination,
    /// Mint the fee to the fee account
    CollectFee,
    /// Report the completed operation to the registry
    Audit,
}

const DEPOSIT: &[Step] = &[
    Step::ComplianceCheck,
    Step::ValidateExternal,
    Step::RegisterReserve,
    Step::Mint,
    Step::Audit,
];

const WITHDRAWAL: &[Step] = &[
    Step::ComplianceCheck,
    Step::ValidateBalance,
    Step::Burn,
    Step::ProcessReserve,
    Step::InitiateExternal,
    Step::Audit,
];

const EXCHANGE: &[Step] = &[
    Step::ComplianceCheck,
    Step::ResolveRate,
    Step::DebitSource,
    Step::CreditDestination,
    Step::CollectFee,
    Step::Audit,
];

/// Ordered steps for a workflow kind
pub fn workflow(kind: OperationKind) -> &'static [Step] {
    match kind {
        OperationKind::Deposit => DEPOSIT,
        OperationKind::Withdrawal => WITHDRAWAL,
        OperationKind::Exchange => EXCHANGE,
    }
}

impl Step {
    /// Operation status while this step runs
    pub fn status(&self) -> OperationStatus {
        match self {
            Step::ComplianceCheck => OperationStatus::ComplianceChecking,
            Step::ValidateExternal => OperationStatus::ExternalValidating,
            Step::RegisterReserve => OperationStatus::ReserveRegistering,
            Step::Mint => OperationStatus::Minting,
            Step::ValidateBalance => OperationStatus::BalanceValidating,
            Step::Burn => OperationStatus::Burning,
            Step::ProcessReserve => OperationStatus::ReserveProcessing,
            Step::InitiateExternal => OperationStatus::ExternalInitiating,
            Step::ResolveRate => OperationStatus::RateResolving,
            Step::DebitSource => OperationStatus::SourceDebiting,
            Step::CreditDestination => OperationStatus::DestinationCrediting,
            Step::CollectFee => OperationStatus::FeeCollecting,
            Step::Audit => OperationStatus::LoggingAudit,
        }
    }

    /// Step changes state on an external ledger
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Step::RegisterReserve
                | Step::Mint
                | Step::Burn
                | Step::ProcessReserve
                | Step::InitiateExternal
                | Step::DebitSource
                | Step::CreditDestination
                | Step::CollectFee
        )
    }

    /// Name used in logs and collaborator references
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ComplianceCheck => "compliance_check",
            Step::ValidateExternal => "validate_external",
            Step::RegisterReserve => "register_reserve",
            Step::Mint => "mint",
            Step::ValidateBalance => "validate_balance",
            Step::Burn => "burn",
            Step::ProcessReserve => "process_reserve",
            Step::InitiateExternal => "initiate_external",
            Step::ResolveRate => "resolve_rate",
            Step::DebitSource => "debit_source",
            Step::CreditDestination => "credit_destination",
            Step::CollectFee => "collect_fee",
            Step::Audit => "audit",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
