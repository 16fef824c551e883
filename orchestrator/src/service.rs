//! Produced service interface
//!
//! Every payload is wrapped in [`Versioned`]. Optional fields are skipped
//! when absent and default when missing, so consumers built against an
//! older payload keep working as fields are added.

use crate::orchestrator::{CancelOutcome, Orchestrator};
use crate::record::{OperationRecord, OperationRequest};
use compliance_gateway::UsageReport;
use reconciliation::{
    CheckTrigger, DiscrepancyAlert, HaltState, ProofScheduler, ReconciliationEngine,
    ReconciliationResult, ReserveProofRecord,
};
use reserve_core::{
    AccountId, Clock, DenialReason, Error, ErrorClass, OperationId, OperationStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Current payload version
pub const API_VERSION: u32 = 1;

/// Versioned payload envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Payload version
    pub api_version: u32,
    /// Payload
    pub data: T,
}

impl<T> Versioned<T> {
    /// Wrap at the current version
    pub fn new(data: T) -> Self {
        Self {
            api_version: API_VERSION,
            data,
        }
    }
}

/// Error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Payload version
    pub api_version: u32,
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Retrying later may succeed
    #[serde(default)]
    pub retryable: bool,
    /// Operation the error refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Compliance denial detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialReason>,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::Validation(_) => "validation",
            Error::ComplianceDenied { .. } => "compliance_denied",
            Error::Halted(_) => "halted",
            Error::OperationNotFound(_) | Error::AlertNotFound(_) => "not_found",
            Error::InvalidState(_) => "invalid_state",
            _ => match err.class() {
                ErrorClass::TransientInfrastructure => "unavailable",
                ErrorClass::PermanentExternalFailure => "rejected",
                ErrorClass::PartialRollback => "partial_rollback",
                _ => "internal",
            },
        };
        let (operation_id, denial) = match &err {
            Error::ComplianceDenied {
                operation_id,
                reason,
            } => (*operation_id, Some(reason.clone())),
            Error::PartialRollback { operation_id, .. } => (Some(*operation_id), None),
            _ => (None, None),
        };
        Self {
            api_version: API_VERSION,
            code: code.to_string(),
            message: err.to_string(),
            retryable: err.is_transient(),
            operation_id,
            denial,
        }
    }
}

/// Service result
pub type ApiResult<T> = std::result::Result<Versioned<T>, ApiError>;

/// Accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Operation to poll
    pub operation_id: OperationId,
    /// Status at acceptance
    pub status: OperationStatus,
}

/// Alert acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeRequest {
    /// Alert
    pub alert_id: Uuid,
    /// Operator acknowledging
    pub operator: String,
}

/// Halt flag view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltStatus {
    /// Flag is set
    pub halted: bool,
    /// Why and when, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HaltState>,
}

/// Façade consumed by dashboards and operator tooling
pub struct ReserveService {
    orchestrator: Arc<Orchestrator>,
    reconciliation: Arc<ReconciliationEngine>,
    proofs: Arc<ProofScheduler>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ReserveService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReserveService")
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl ReserveService {
    /// Create new service
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        reconciliation: Arc<ReconciliationEngine>,
        proofs: Arc<ProofScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orchestrator,
            reconciliation,
            proofs,
            clock,
        }
    }

    /// Submit an operation
    pub async fn submit_operation(&self, request: OperationRequest) -> ApiResult<SubmitResponse> {
        let operation_id = self.orchestrator.submit(request).await?;
        let status = self.orchestrator.get_status(&operation_id)?.status;
        Ok(Versioned::new(SubmitResponse {
            operation_id,
            status,
        }))
    }

    /// Current record for a hex operation ID
    pub async fn get_operation_status(&self, operation_id: &str) -> ApiResult<OperationRecord> {
        let id: OperationId = operation_id.parse()?;
        Ok(Versioned::new(self.orchestrator.get_status(&id)?))
    }

    /// Administrative cancel
    pub async fn cancel_operation(&self, operation_id: &str, operator: &str) -> ApiResult<CancelOutcome> {
        let id: OperationId = operation_id.parse()?;
        Ok(Versioned::new(self.orchestrator.cancel(&id, operator).await?))
    }

    /// Up to `limit` reconciliation results, newest first
    pub async fn get_reconciliation_history(&self, limit: usize) -> ApiResult<Vec<ReconciliationResult>> {
        Ok(Versioned::new(self.reconciliation.history(limit)))
    }

    /// Run a reconciliation check now
    pub async fn run_reconciliation(&self) -> ApiResult<ReconciliationResult> {
        Ok(Versioned::new(
            self.reconciliation.run_check(CheckTrigger::Manual).await?,
        ))
    }

    /// Unacknowledged discrepancy alerts
    pub async fn get_active_alerts(&self) -> ApiResult<Vec<DiscrepancyAlert>> {
        Ok(Versioned::new(self.reconciliation.active_alerts()))
    }

    /// Acknowledge a discrepancy alert
    pub async fn acknowledge_alert(&self, request: AcknowledgeRequest) -> ApiResult<DiscrepancyAlert> {
        Ok(Versioned::new(
            self.reconciliation
                .acknowledge_alert(request.alert_id, &request.operator)?,
        ))
    }

    /// Halt flag state
    pub async fn get_halt_status(&self) -> ApiResult<HaltStatus> {
        let halt = self.orchestrator.halt();
        Ok(Versioned::new(HaltStatus {
            halted: halt.is_halted(),
            state: halt.state(),
        }))
    }

    /// Clear the halt flag (administrative)
    pub async fn clear_halt(&self, operator: &str) -> ApiResult<HaltState> {
        let previous = self.orchestrator.halt().clear(operator, self.clock.now())?;
        info!(operator, reason = %previous.reason, "Halt cleared through service");
        Ok(Versioned::new(previous))
    }

    /// Compliance usage and ceilings for an account
    pub async fn get_compliance_usage(&self, account: &str) -> ApiResult<UsageReport> {
        let account = AccountId::new(account);
        if account.is_blank() {
            return Err(Error::Validation("account must not be empty".into()).into());
        }
        Ok(Versioned::new(self.orchestrator.gateway().usage(&account).await))
    }

    /// Up to `limit` proofs, newest first
    pub async fn get_proof_history(&self, limit: usize) -> ApiResult<Vec<ReserveProofRecord>> {
        Ok(Versioned::new(self.proofs.history(limit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reserve_core::Tier;

    #[test]
    fn test_denial_maps_to_payload() {
        let id = OperationId::generate();
        let err: ApiError = Error::ComplianceDenied {
            operation_id: Some(id),
            reason: DenialReason::TierTooLow {
                tier: Tier::Tier0,
                required: Tier::Tier1,
            },
        }
        .into();
        assert_eq!(err.code, "compliance_denied");
        assert_eq!(err.operation_id, Some(id));
        assert!(!err.retryable);

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["api_version"], 1);
        assert_eq!(json["denial"]["reason"], "tier_too_low");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let err: ApiError = serde_json::from_str(
            r#"{"api_version":1,"code":"halted","message":"Operations halted: drift"}"#,
        )
        .unwrap();
        assert!(!err.retryable);
        assert!(err.operation_id.is_none());
        assert!(err.denial.is_none());
    }

    #[test]
    fn test_transient_is_retryable() {
        let err: ApiError = Error::Unavailable("custody".into()).into();
        assert_eq!(err.code, "unavailable");
        assert!(err.retryable);
    }
}
