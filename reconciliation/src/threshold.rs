//! Discrepancy thresholds

use reserve_core::config::ReconciliationConfig;
use reserve_core::{AlertSeverity, Amount, ReconciliationStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Threshold ladder in percent units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// At or below: consistent
    pub tolerance_pct: Decimal,
    /// Minor/Warning boundary
    pub warning_pct: Decimal,
    /// Warning/Critical boundary
    pub critical_pct: Decimal,
    /// Above: halt
    pub halt_pct: Decimal,
}

/// Classified comparison of custody against issued supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    /// |custody − issued|
    pub discrepancy_abs: Amount,
    /// Relative discrepancy in percent
    pub discrepancy_pct: Decimal,
    /// Check status
    pub status: ReconciliationStatus,
    /// Alert severity, when above tolerance
    pub severity: Option<AlertSeverity>,
}

impl Thresholds {
    /// Ladder from the reconciliation section
    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self {
            tolerance_pct: config.tolerance_pct,
            warning_pct: config.warning_pct,
            critical_pct: config.critical_pct,
            halt_pct: config.halt_pct,
        }
    }

    /// Relative discrepancy in percent
    ///
    /// Custody with nothing issued counts as 100%; both zero is 0%.
    pub fn discrepancy_pct(custody_total: Amount, issued_total: Amount) -> Decimal {
        let diff = (custody_total - issued_total).abs();
        if issued_total > Decimal::ZERO {
            diff / issued_total * Decimal::ONE_HUNDRED
        } else if diff > Decimal::ZERO {
            Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    }

    /// Classify one comparison
    pub fn assess(&self, custody_total: Amount, issued_total: Amount) -> Assessment {
        let discrepancy_abs = (custody_total - issued_total).abs();
        let discrepancy_pct = Self::discrepancy_pct(custody_total, issued_total);

        let (status, severity) = if discrepancy_pct <= self.tolerance_pct {
            (ReconciliationStatus::Consistent, None)
        } else if discrepancy_pct <= self.warning_pct {
            (
                ReconciliationStatus::MinorDiscrepancy,
                Some(AlertSeverity::Minor),
            )
        } else if discrepancy_pct <= self.critical_pct {
            (
                ReconciliationStatus::MinorDiscrepancy,
                Some(AlertSeverity::Warning),
            )
        } else if discrepancy_pct <= self.halt_pct {
            (
                ReconciliationStatus::MinorDiscrepancy,
                Some(AlertSeverity::Critical),
            )
        } else {
            (ReconciliationStatus::Halted, Some(AlertSeverity::Emergency))
        };

        Assessment {
            discrepancy_abs,
            discrepancy_pct,
            status,
            severity,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&ReconciliationConfig::default())
    }
}
