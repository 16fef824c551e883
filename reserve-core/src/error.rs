//! Error taxonomy
//!
//! Every failure maps onto one [`ErrorClass`]. The class decides what the
//! orchestrator does with it: retry, fail, roll back, or halt.

use crate::types::{AccountId, OperationId, Tier};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for reserve rail operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification driving retry and rollback decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Malformed input; never retried, no record created
    Validation,
    /// Compliance said no; terminal, nothing to undo
    ComplianceDenial,
    /// Timeout or unavailable; retried with backoff
    TransientInfrastructure,
    /// Definitive external refusal; no retry
    PermanentExternalFailure,
    /// Reserve discrepancy; sets the global halt
    ConsistencyBreach,
    /// Compensation exhausted its retries
    PartialRollback,
    /// Local configuration, storage or serialization fault
    Internal,
}

/// Why the compliance gateway refused an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// Account tier below the category minimum
    TierTooLow {
        /// Tier on record
        tier: Tier,
        /// Minimum tier for the category
        required: Tier,
    },
    /// Rolling 24h ceiling would be exceeded
    DailyLimitExceeded {
        /// Ceiling for the tier/category
        ceiling: Decimal,
        /// Already used in the window
        used: Decimal,
        /// Requested amount
        requested: Decimal,
    },
    /// Rolling 30d ceiling would be exceeded
    MonthlyLimitExceeded {
        /// Ceiling for the tier/category
        ceiling: Decimal,
        /// Already used in the window
        used: Decimal,
        /// Requested amount
        requested: Decimal,
    },
    /// Sanctions screening hold
    SanctionsHold,
    /// Identity verification expired
    ExpiredVerification,
    /// Registry declined the operation
    NotApproved,
    /// Large-transaction secondary verification failed
    EnhancedVerificationFailed,
    /// Registry could not be reached (deny-by-default)
    RegistryUnavailable {
        /// Underlying failure
        detail: String,
    },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::TierTooLow { tier, required } => {
                write!(f, "tier too low: {} < {}", tier, required)
            }
            DenialReason::DailyLimitExceeded {
                ceiling,
                used,
                requested,
            } => write!(
                f,
                "daily window exceeded: {} used + {} requested > {} ceiling",
                used, requested, ceiling
            ),
            DenialReason::MonthlyLimitExceeded {
                ceiling,
                used,
                requested,
            } => write!(
                f,
                "monthly window exceeded: {} used + {} requested > {} ceiling",
                used, requested, ceiling
            ),
            DenialReason::SanctionsHold => write!(f, "sanctions hold"),
            DenialReason::ExpiredVerification => write!(f, "verification expired"),
            DenialReason::NotApproved => write!(f, "not approved by registry"),
            DenialReason::EnhancedVerificationFailed => {
                write!(f, "enhanced verification failed")
            }
            DenialReason::RegistryUnavailable { detail } => {
                write!(f, "registry unavailable: {}", detail)
            }
        }
    }
}

impl DenialReason {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            DenialReason::TierTooLow { .. } => "tier_too_low",
            DenialReason::DailyLimitExceeded { .. } => "daily_limit",
            DenialReason::MonthlyLimitExceeded { .. } => "monthly_limit",
            DenialReason::SanctionsHold => "sanctions_hold",
            DenialReason::ExpiredVerification => "expired_verification",
            DenialReason::NotApproved => "not_approved",
            DenialReason::EnhancedVerificationFailed => "enhanced_verification",
            DenialReason::RegistryUnavailable { .. } => "registry_unavailable",
        }
    }
}

/// Reserve rail errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Compliance gateway denial
    #[error("Compliance denied: {reason}")]
    ComplianceDenied {
        /// Record created for the denied submission, if any
        operation_id: Option<OperationId>,
        /// Denial reason
        reason: DenialReason,
    },

    /// New operations are blocked by the reconciliation halt flag
    #[error("Operations halted: {0}")]
    Halted(String),

    /// External call exceeded its bounded timeout
    #[error("Timeout after {timeout_ms} ms: {operation}")]
    Timeout {
        /// Collaborator call name
        operation: String,
        /// Timeout in effect
        timeout_ms: u64,
    },

    /// Collaborator temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Token balance too low
    #[error("Insufficient balance for {account}: required {required}, available {available}")]
    InsufficientBalance {
        /// Account debited
        account: AccountId,
        /// Amount needed
        required: Decimal,
        /// Amount held
        available: Decimal,
    },

    /// Custody cannot cover the withdrawal
    #[error("Insufficient reserves: {0}")]
    InsufficientReserves(String),

    /// Withdrawal destination refused
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Collaborator refused the request definitively
    #[error("Rejected by {collaborator}: {reason}")]
    Rejected {
        /// Which collaborator
        collaborator: String,
        /// Refusal detail
        reason: String,
    },

    /// Quoted output below the caller's minimum
    #[error("Slippage exceeded: minimum {minimum}, quoted {quoted}")]
    SlippageExceeded {
        /// Caller's minimum output
        minimum: Decimal,
        /// Quoted output
        quoted: Decimal,
    },

    /// Neither oracle nor fallback produced a usable rate
    #[error("Rate unavailable for {pair}: {reason}")]
    RateUnavailable {
        /// Asset pair
        pair: String,
        /// Why
        reason: String,
    },

    /// Compensation could not be completed
    #[error("Partial rollback of operation {operation_id}: {detail}")]
    PartialRollback {
        /// Operation left for manual reconciliation
        operation_id: OperationId,
        /// Failed compensations
        detail: String,
    },

    /// Operation administratively cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unknown operation identifier
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Unknown alert identifier
    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    /// Action not allowed in the current state
    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Map onto the taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_) => ErrorClass::Validation,
            Error::ComplianceDenied { .. } => ErrorClass::ComplianceDenial,
            Error::Timeout { .. } | Error::Unavailable(_) | Error::RateUnavailable { .. } => {
                ErrorClass::TransientInfrastructure
            }
            Error::InsufficientBalance { .. }
            | Error::InsufficientReserves(_)
            | Error::InvalidDestination(_)
            | Error::Rejected { .. }
            | Error::SlippageExceeded { .. }
            | Error::Cancelled(_) => ErrorClass::PermanentExternalFailure,
            Error::Halted(_) => ErrorClass::ConsistencyBreach,
            Error::PartialRollback { .. } => ErrorClass::PartialRollback,
            Error::OperationNotFound(_)
            | Error::AlertNotFound(_)
            | Error::InvalidState(_)
            | Error::Config(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Io(_) => ErrorClass::Internal,
        }
    }

    /// Only transient infrastructure faults are retried
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientInfrastructure
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Unavailable("registry".into()).is_transient());
        assert!(Error::Timeout {
            operation: "mint".into(),
            timeout_ms: 10
        }
        .is_transient());
        assert!(!Error::InsufficientReserves("cold wallet".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_denial_is_not_retried() {
        let err = Error::ComplianceDenied {
            operation_id: None,
            reason: DenialReason::SanctionsHold,
        };
        assert_eq!(err.class(), ErrorClass::ComplianceDenial);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_halt_and_partial_rollback_classes() {
        assert_eq!(
            Error::Halted("drift".into()).class(),
            ErrorClass::ConsistencyBreach
        );
        let err = Error::PartialRollback {
            operation_id: OperationId::generate(),
            detail: "cancel_deposit: custody down".into(),
        };
        assert_eq!(err.class(), ErrorClass::PartialRollback);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_denial_reason_serializes_tagged() {
        let json = serde_json::to_value(DenialReason::TierTooLow {
            tier: Tier::Tier0,
            required: Tier::Tier1,
        })
        .unwrap();
        assert_eq!(json["reason"], "tier_too_low");
    }
}
