//! Operation records
//!
//! A record is saved after every transition. Each completed mutating step
//! stores the exact compensation that undoes it, so rollback can resume
//! from the stored record after a restart.

use crate::plan::{workflow, Step};
use chrono::{DateTime, Utc};
use compliance_gateway::Allocation;
use rate_resolver::Quote;
use reserve_core::{
    AccountId, Amount, AssetId, Error, OperationId, OperationKind, OperationStatus, Result,
};
use serde::{Deserialize, Serialize};

/// Workflow-specific request parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationParams {
    /// External asset in, reserve token out
    Deposit {
        /// Amount deposited, in base units
        amount: Amount,
        /// Off-ledger transfer reference (idempotency key)
        external_reference: String,
        /// Confirmations reported by the caller
        confirmations: u32,
    },
    /// Reserve token in, external asset out
    Withdrawal {
        /// Amount redeemed, in base units
        amount: Amount,
        /// Off-ledger destination address
        destination: String,
    },
    /// Swap between two token assets
    Exchange {
        /// Asset sold
        from_asset: AssetId,
        /// Asset bought
        to_asset: AssetId,
        /// Amount of `from_asset` sold
        amount: Amount,
        /// Account credited; defaults to the initiator
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<AccountId>,
        /// Minimum acceptable output
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_amount_out: Option<Amount>,
    },
}

impl OperationParams {
    /// Workflow kind
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationParams::Deposit { .. } => OperationKind::Deposit,
            OperationParams::Withdrawal { .. } => OperationKind::Withdrawal,
            OperationParams::Exchange { .. } => OperationKind::Exchange,
        }
    }

    /// Primary amount
    pub fn amount(&self) -> Amount {
        match self {
            OperationParams::Deposit { amount, .. }
            | OperationParams::Withdrawal { amount, .. }
            | OperationParams::Exchange { amount, .. } => *amount,
        }
    }

    /// Idempotency key, for deposits
    pub fn external_reference(&self) -> Option<&str> {
        match self {
            OperationParams::Deposit {
                external_reference, ..
            } => Some(external_reference.as_str()),
            _ => None,
        }
    }

    /// Reject malformed input before any record exists
    pub fn validate(&self, min_confirmations: u32) -> Result<()> {
        if self.amount() <= Amount::ZERO {
            return Err(Error::Validation(format!(
                "amount must be positive, got {}",
                self.amount()
            )));
        }

        match self {
            OperationParams::Deposit {
                external_reference,
                confirmations,
                ..
            } => {
                if external_reference.trim().is_empty() {
                    return Err(Error::Validation(
                        "deposit requires an external reference".into(),
                    ));
                }
                if *confirmations < min_confirmations {
                    return Err(Error::Validation(format!(
                        "deposit reported with {} confirmations, {} required",
                        confirmations, min_confirmations
                    )));
                }
            }
            OperationParams::Withdrawal { destination, .. } => {
                if destination.trim().is_empty() {
                    return Err(Error::Validation(
                        "withdrawal requires a destination".into(),
                    ));
                }
            }
            OperationParams::Exchange {
                from_asset,
                to_asset,
                destination,
                min_amount_out,
                ..
            } => {
                if from_asset == to_asset {
                    return Err(Error::Validation(format!(
                        "cannot exchange {} for itself",
                        from_asset
                    )));
                }
                if destination.as_ref().map(|d| d.is_blank()).unwrap_or(false) {
                    return Err(Error::Validation("destination must not be empty".into()));
                }
                if min_amount_out.map(|m| m < Amount::ZERO).unwrap_or(false) {
                    return Err(Error::Validation(
                        "minimum output must not be negative".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Submission payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Initiating account
    pub account: AccountId,
    /// Workflow parameters
    #[serde(flatten)]
    pub params: OperationParams,
}

impl OperationRequest {
    /// Create a request
    pub fn new(account: AccountId, params: OperationParams) -> Self {
        Self { account, params }
    }
}

/// Inverse of a completed mutating step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Compensation {
    /// Cancel a custody deposit registration
    CancelDeposit {
        /// Deposit reference
        reference: String,
    },
    /// Burn tokens that were minted
    Burn {
        /// Token asset
        asset: AssetId,
        /// Account credited by the step
        account: AccountId,
        /// Amount credited
        amount: Amount,
        /// Ledger reference for the compensating burn
        reference: String,
    },
    /// Re-issue tokens that were burned
    Mint {
        /// Token asset
        asset: AssetId,
        /// Account debited by the step
        account: AccountId,
        /// Amount debited
        amount: Amount,
        /// Ledger reference for the compensating mint
        reference: String,
    },
    /// Cancel a processed custody withdrawal
    CancelWithdrawal {
        /// Withdrawal ID
        withdrawal_id: String,
    },
    /// No inverse exists; rollback past this point needs manual reconciliation
    Irreversible {
        /// What was released
        detail: String,
    },
}

impl Compensation {
    /// Name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Compensation::CancelDeposit { .. } => "cancel_deposit",
            Compensation::Burn { .. } => "burn",
            Compensation::Mint { .. } => "mint",
            Compensation::CancelWithdrawal { .. } => "cancel_withdrawal",
            Compensation::Irreversible { .. } => "irreversible",
        }
    }
}

/// Outcome of one completed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step
    pub step: Step,
    /// Attempts made, including the first
    pub attempts: u32,
    /// When it completed
    pub completed_at: DateTime<Utc>,
    /// Inverse action, for mutating steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Compensation>,
    /// Compensation has been applied
    #[serde(default)]
    pub compensated: bool,
    /// Step-specific note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One workflow invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Operation ID
    pub id: OperationId,
    /// Workflow kind
    pub kind: OperationKind,
    /// Initiating account
    pub account: AccountId,
    /// Request parameters
    pub params: OperationParams,
    /// Current state
    pub status: OperationStatus,
    /// Index of the next step to run
    pub next_step: usize,
    /// Completed steps, in order
    pub steps: Vec<StepOutcome>,
    /// Compliance usage charged for this operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocations: Vec<Allocation>,
    /// Exchange quote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
    /// Off-ledger transfer reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    /// Why the operation did not complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Administrative cancel arrived after a ledger mutation
    #[serde(default)]
    pub rollback_requested: bool,
    /// Some compensation could not be applied
    #[serde(default)]
    pub partial_rollback: bool,
    /// Compensations that failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_failures: Vec<String>,
    /// Accepted at
    pub created_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Fresh record in `Pending`
    pub fn new(account: AccountId, params: OperationParams, now: DateTime<Utc>) -> Self {
        let external_reference = params.external_reference().map(str::to_string);
        Self {
            id: OperationId::generate(),
            kind: params.kind(),
            account,
            params,
            status: OperationStatus::Pending,
            next_step: 0,
            steps: Vec::new(),
            allocations: Vec::new(),
            quote: None,
            external_reference,
            failure_reason: None,
            rollback_requested: false,
            partial_rollback: false,
            rollback_failures: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Ordered steps for this record's workflow
    pub fn plan(&self) -> &'static [Step] {
        workflow(self.kind)
    }

    /// Next step to run, if any remain
    pub fn next(&self) -> Option<Step> {
        self.plan().get(self.next_step).copied()
    }

    /// At least one ledger mutation completed
    pub fn has_mutated(&self) -> bool {
        self.steps.iter().any(|s| s.compensation.is_some())
    }

    /// Manual reconciliation still owed, if the rollback was partial
    pub fn partial_rollback_error(&self) -> Option<Error> {
        self.partial_rollback.then(|| Error::PartialRollback {
            operation_id: self.id,
            detail: self.rollback_failures.join("; "),
        })
    }

    /// Every ledger mutation has been undone
    pub fn fully_compensated(&self) -> bool {
        !self.partial_rollback
            && self
                .steps
                .iter()
                .all(|s| s.compensation.is_none() || s.compensated)
    }

    /// Record a completed step and advance
    pub fn complete_step(&mut self, outcome: StepOutcome) {
        self.updated_at = outcome.completed_at;
        self.steps.push(outcome);
        self.next_step += 1;
    }

    /// Account credited by an exchange
    pub fn exchange_destination(&self) -> &AccountId {
        match &self.params {
            OperationParams::Exchange {
                destination: Some(destination),
                ..
            } => destination,
            _ => &self.account,
        }
    }

    /// Ledger reference for a step's collaborator call
    pub fn reference(&self, action: &str) -> String {
        format!("{}:{}", self.id, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn deposit(amount: Amount, reference: &str, confirmations: u32) -> OperationParams {
        OperationParams::Deposit {
            amount,
            external_reference: reference.to_string(),
            confirmations,
        }
    }

    #[test]
    fn test_validation() {
        assert!(deposit(dec!(100), "tx-1", 6).validate(6).is_ok());
        assert!(deposit(dec!(0), "tx-1", 6).validate(6).is_err());
        assert!(deposit(dec!(100), " ", 6).validate(6).is_err());
        assert!(deposit(dec!(100), "tx-1", 2).validate(6).is_err());

        let swap = OperationParams::Exchange {
            from_asset: AssetId::new("xBTC"),
            to_asset: AssetId::new("xBTC"),
            amount: dec!(5),
            destination: None,
            min_amount_out: None,
        };
        assert!(matches!(swap.validate(6), Err(Error::Validation(_))));
    }

    #[test]
    fn test_request_payload_shape() {
        let request = OperationRequest::new(
            AccountId::new("alice"),
            OperationParams::Withdrawal {
                amount: dec!(250),
                destination: "bc1qxyz".into(),
            },
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "withdrawal");
        assert_eq!(json["account"], "alice");

        let back: OperationRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_record_tracks_mutation() {
        let mut record = OperationRecord::new(
            AccountId::new("alice"),
            deposit(dec!(100), "tx-1", 6),
            Utc::now(),
        );
        assert_eq!(record.next(), Some(Step::ComplianceCheck));
        assert_eq!(record.external_reference.as_deref(), Some("tx-1"));

        record.complete_step(StepOutcome {
            step: Step::ComplianceCheck,
            attempts: 1,
            completed_at: Utc::now(),
            compensation: None,
            compensated: false,
            detail: None,
        });
        assert!(!record.has_mutated());

        record.complete_step(StepOutcome {
            step: Step::RegisterReserve,
            attempts: 1,
            completed_at: Utc::now(),
            compensation: Some(Compensation::CancelDeposit {
                reference: "tx-1".into(),
            }),
            compensated: false,
            detail: None,
        });
        assert!(record.has_mutated());
        assert_eq!(record.next_step, 2);
    }
}
