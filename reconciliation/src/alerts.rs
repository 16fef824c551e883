//! Discrepancy alerts
//!
//! Alerts are never resolved automatically. The only mutation is an
//! explicit acknowledgment.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reserve_core::{AlertSeverity, Amount, Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Action assigned with an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectiveMeasure {
    /// Keep watching
    Monitor,
    /// Open an investigation
    Investigate,
    /// Escalate to risk and finance
    Escalate,
    /// Block new operations
    HaltOperations,
}

impl From<AlertSeverity> for ProtectiveMeasure {
    fn from(severity: AlertSeverity) -> Self {
        match severity {
            AlertSeverity::Minor => ProtectiveMeasure::Monitor,
            AlertSeverity::Warning => ProtectiveMeasure::Investigate,
            AlertSeverity::Critical => ProtectiveMeasure::Escalate,
            AlertSeverity::Emergency => ProtectiveMeasure::HaltOperations,
        }
    }
}

/// Alert raised by a reconciliation check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyAlert {
    /// Alert ID
    pub id: Uuid,
    /// Check that raised it
    pub result_id: Uuid,
    /// Severity
    pub severity: AlertSeverity,
    /// Assigned measure
    pub measure: ProtectiveMeasure,
    /// Custody at check time
    pub custody_total: Amount,
    /// Issued supply at check time
    pub issued_total: Amount,
    /// Discrepancy in percent
    pub discrepancy_pct: Decimal,
    /// Acknowledged by an operator
    pub acknowledged: bool,
    /// Who acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    /// When acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When raised
    pub created_at: DateTime<Utc>,
}

/// All alerts raised so far
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: RwLock<Vec<DiscrepancyAlert>>,
}

impl AlertBook {
    /// Create an empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new alert
    pub fn raise(
        &self,
        result_id: Uuid,
        severity: AlertSeverity,
        custody_total: Amount,
        issued_total: Amount,
        discrepancy_pct: Decimal,
        at: DateTime<Utc>,
    ) -> DiscrepancyAlert {
        let alert = DiscrepancyAlert {
            id: Uuid::new_v4(),
            result_id,
            severity,
            measure: severity.into(),
            custody_total,
            issued_total,
            discrepancy_pct,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: at,
        };
        warn!(
            alert_id = %alert.id,
            severity = ?severity,
            %discrepancy_pct,
            "Discrepancy alert raised"
        );
        self.alerts.write().push(alert.clone());
        alert
    }

    /// Unacknowledged alerts, most severe first, then newest
    pub fn active(&self) -> Vec<DiscrepancyAlert> {
        let mut active: Vec<_> = self
            .alerts
            .read()
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        active
    }

    /// Acknowledge an alert; acknowledging twice keeps the first operator
    pub fn acknowledge(&self, id: Uuid, by: &str, at: DateTime<Utc>) -> Result<DiscrepancyAlert> {
        if by.trim().is_empty() {
            return Err(Error::Validation("acknowledgment requires an operator".into()));
        }
        let mut alerts = self.alerts.write();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::AlertNotFound(id.to_string()))?;

        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(by.to_string());
            alert.acknowledged_at = Some(at);
            info!(alert_id = %id, by, "Alert acknowledged");
        }
        Ok(alert.clone())
    }

    /// Look up one alert
    pub fn get(&self, id: Uuid) -> Option<DiscrepancyAlert> {
        self.alerts.read().iter().find(|a| a.id == id).cloned()
    }

    /// Total alerts raised
    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    /// No alerts raised
    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }
}
