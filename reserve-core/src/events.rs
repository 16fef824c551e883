//! Correlation-tagged events
//!
//! Published on a `tokio::sync::broadcast` channel. Publishing never blocks
//! and never fails the caller; a bus without subscribers drops events.

use crate::types::{
    AccountId, AlertSeverity, ComplianceCategory, OperationId, OperationKind, OperationStatus,
    ReconciliationStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event emitted by the rail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Operation moved to a new state
    OperationTransitioned {
        /// Operation
        operation_id: OperationId,
        /// Workflow kind
        kind: OperationKind,
        /// Previous state
        from: OperationStatus,
        /// New state
        to: OperationStatus,
        /// When
        at: DateTime<Utc>,
    },

    /// Operation reached a terminal state
    OperationFinalized {
        /// Operation
        operation_id: OperationId,
        /// Workflow kind
        kind: OperationKind,
        /// Terminal state
        status: OperationStatus,
        /// Some compensation could not be completed
        partial_rollback: bool,
        /// Failure reason, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// When
        at: DateTime<Utc>,
    },

    /// Usage crossed the warning ratio of a ceiling
    ComplianceWarning {
        /// Account
        account: AccountId,
        /// Category
        category: ComplianceCategory,
        /// "daily" or "monthly"
        window: String,
        /// Usage after the charge
        used: Decimal,
        /// Ceiling
        ceiling: Decimal,
        /// Correlation ID of the charging operation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    /// Reconciliation found a discrepancy above tolerance
    DiscrepancyDetected {
        /// Alert raised
        alert_id: Uuid,
        /// Severity
        severity: AlertSeverity,
        /// Check status
        status: ReconciliationStatus,
        /// Discrepancy in percent
        discrepancy_pct: Decimal,
        /// When
        at: DateTime<Utc>,
    },

    /// Global halt set
    HaltRaised {
        /// Why
        reason: String,
        /// When
        at: DateTime<Utc>,
    },

    /// Global halt cleared by an administrator
    HaltCleared {
        /// Who
        cleared_by: String,
        /// When
        at: DateTime<Utc>,
    },

    /// Proof of reserves generated and verified
    ProofGenerated {
        /// Proof record
        proof_id: Uuid,
        /// custody / issued
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ratio: Option<Decimal>,
        /// Verification passed
        verified: bool,
        /// When
        at: DateTime<Utc>,
    },
}

impl Event {
    /// Snake-case event name
    pub fn name(&self) -> &'static str {
        match self {
            Event::OperationTransitioned { .. } => "operation_transitioned",
            Event::OperationFinalized { .. } => "operation_finalized",
            Event::ComplianceWarning { .. } => "compliance_warning",
            Event::DiscrepancyDetected { .. } => "discrepancy_detected",
            Event::HaltRaised { .. } => "halt_raised",
            Event::HaltCleared { .. } => "halt_cleared",
            Event::ProofGenerated { .. } => "proof_generated",
        }
    }
}

/// Fan-out event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining `capacity` events per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event
    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.name(), "Publishing event");
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
