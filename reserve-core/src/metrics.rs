//! Metrics collection for observability
//!
//! Prometheus metrics for the reserve rail. Each [`Metrics`] owns its own
//! registry so several instances can coexist in one process.
//!
//! # Metrics
//!
//! - `reserve_operations_submitted_total` - Accepted submissions by kind
//! - `reserve_operations_finalized_total` - Terminal states by kind and status
//! - `reserve_step_retries_total` - Retries of forward and compensation steps
//! - `reserve_partial_rollbacks_total` - Operations left for manual reconciliation
//! - `reserve_compliance_denials_total` - Gateway denials by reason
//! - `reserve_reconciliation_checks_total` - Reconciliation checks by status
//! - `reserve_reconciliation_failures_total` - Checks that could not read totals
//! - `reserve_discrepancy_pct` - Last measured discrepancy (percent)
//! - `reserve_halted` - 1 while the global halt flag is set
//! - `reserve_proofs_total` - Proofs generated by verification outcome

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Accepted submissions
    pub submissions: IntCounterVec,

    /// Terminal states
    pub finalized: IntCounterVec,

    /// Step retries
    pub step_retries: IntCounter,

    /// Partial rollbacks
    pub partial_rollbacks: IntCounter,

    /// Compliance denials
    pub compliance_denials: IntCounterVec,

    /// Reconciliation checks
    pub reconciliation_checks: IntCounterVec,

    /// Reconciliation checks that failed to run
    pub reconciliation_failures: IntCounter,

    /// Last discrepancy
    pub discrepancy_pct: Gauge,

    /// Halt flag
    pub halted: IntGauge,

    /// Proofs generated
    pub proofs: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let submissions = IntCounterVec::new(
            Opts::new(
                "reserve_operations_submitted_total",
                "Accepted operation submissions",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(submissions.clone()))?;

        let finalized = IntCounterVec::new(
            Opts::new(
                "reserve_operations_finalized_total",
                "Operations reaching a terminal state",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(finalized.clone()))?;

        let step_retries = IntCounter::new(
            "reserve_step_retries_total",
            "Retries of workflow and compensation steps",
        )?;
        registry.register(Box::new(step_retries.clone()))?;

        let partial_rollbacks = IntCounter::new(
            "reserve_partial_rollbacks_total",
            "Operations rolled back only partially",
        )?;
        registry.register(Box::new(partial_rollbacks.clone()))?;

        let compliance_denials = IntCounterVec::new(
            Opts::new(
                "reserve_compliance_denials_total",
                "Compliance gateway denials",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(compliance_denials.clone()))?;

        let reconciliation_checks = IntCounterVec::new(
            Opts::new(
                "reserve_reconciliation_checks_total",
                "Reserve reconciliation checks",
            ),
            &["status"],
        )?;
        registry.register(Box::new(reconciliation_checks.clone()))?;

        let reconciliation_failures = IntCounter::new(
            "reserve_reconciliation_failures_total",
            "Reconciliation checks that could not read totals",
        )?;
        registry.register(Box::new(reconciliation_failures.clone()))?;

        let discrepancy_pct = Gauge::new(
            "reserve_discrepancy_pct",
            "Last measured custody/issued discrepancy in percent",
        )?;
        registry.register(Box::new(discrepancy_pct.clone()))?;

        let halted = IntGauge::new("reserve_halted", "Global halt flag")?;
        registry.register(Box::new(halted.clone()))?;

        let proofs = IntCounterVec::new(
            Opts::new("reserve_proofs_total", "Proofs of reserves generated"),
            &["verified"],
        )?;
        registry.register(Box::new(proofs.clone()))?;

        Ok(Self {
            submissions,
            finalized,
            step_retries,
            partial_rollbacks,
            compliance_denials,
            reconciliation_checks,
            reconciliation_failures,
            discrepancy_pct,
            halted,
            proofs,
            registry,
        })
    }

    /// Record an accepted submission
    pub fn record_submission(&self, kind: &str) {
        self.submissions.with_label_values(&[kind]).inc();
    }

    /// Record a terminal state
    pub fn record_finalized(&self, kind: &str, status: &str, partial_rollback: bool) {
        self.finalized.with_label_values(&[kind, status]).inc();
        if partial_rollback {
            self.partial_rollbacks.inc();
        }
    }

    /// Record retries of one step
    pub fn record_retries(&self, retries: u32) {
        if retries > 0 {
            self.step_retries.inc_by(retries as u64);
        }
    }

    /// Record a compliance denial
    pub fn record_denial(&self, reason: &str) {
        self.compliance_denials.with_label_values(&[reason]).inc();
    }

    /// Record a reconciliation check
    pub fn record_reconciliation(&self, status: &str, discrepancy_pct: f64) {
        self.reconciliation_checks.with_label_values(&[status]).inc();
        self.discrepancy_pct.set(discrepancy_pct);
    }

    /// Record a reconciliation check that could not complete
    pub fn record_reconciliation_failure(&self) {
        self.reconciliation_failures.inc();
    }

    /// Mirror the halt flag
    pub fn set_halted(&self, halted: bool) {
        self.halted.set(i64::from(halted));
    }

    /// Record a generated proof
    pub fn record_proof(&self, verified: bool) {
        let label = if verified { "true" } else { "false" };
        self.proofs.with_label_values(&[label]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_submission("deposit");
        metrics.record_finalized("deposit", "rolled_back", true);
        metrics.record_retries(2);
        metrics.set_halted(true);

        assert_eq!(metrics.step_retries.get(), 2);
        assert_eq!(metrics.partial_rollbacks.get(), 1);
        assert_eq!(metrics.halted.get(), 1);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_denial("sanctions_hold");
        assert!(a.gather_text().contains("reserve_compliance_denials_total"));
        assert_eq!(
            b.compliance_denials
                .with_label_values(&["sanctions_hold"])
                .get(),
            0
        );
    }
}
