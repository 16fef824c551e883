//! Reserve reconciliation engine

use crate::alerts::{AlertBook, DiscrepancyAlert};
use crate::halt::HaltSwitch;
use crate::history::BoundedHistory;
use crate::threshold::Thresholds;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reserve_core::config::ReconciliationConfig;
use reserve_core::{
    Amount, Clock, CustodyLedger, Event, EventBus, Metrics, OperationId, ReconciliationStatus,
    Result, RetryPolicy, TokenLedger,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

/// What started a check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum CheckTrigger {
    /// Periodic timer
    Scheduled,
    /// Completed mint/burn workflow
    PostSettlement {
        /// Operation that completed
        operation_id: OperationId,
    },
    /// Operator request
    Manual,
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// Check ID
    pub id: Uuid,
    /// Measured custody holdings
    pub custody_total: Amount,
    /// Measured issued supply
    pub issued_total: Amount,
    /// |custody − issued|
    pub discrepancy_abs: Amount,
    /// Relative discrepancy in percent
    pub discrepancy_pct: Decimal,
    /// Tolerance in effect
    pub tolerance_pct: Decimal,
    /// Outcome
    pub status: ReconciliationStatus,
    /// What started the check
    #[serde(flatten)]
    pub trigger: CheckTrigger,
    /// Alert raised by this check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<Uuid>,
    /// When checked
    pub checked_at: DateTime<Utc>,
}

/// Reconciliation engine
pub struct ReconciliationEngine {
    custody: Arc<dyn CustodyLedger>,
    supply: Option<Arc<dyn TokenLedger>>,
    config: ReconciliationConfig,
    thresholds: Thresholds,
    halt: Arc<HaltSwitch>,
    alerts: AlertBook,
    history: Mutex<BoundedHistory<ReconciliationResult>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("thresholds", &self.thresholds)
            .field("halted", &self.halt.is_halted())
            .field("history_len", &self.history.lock().len())
            .finish()
    }
}

impl ReconciliationEngine {
    /// Create new engine
    pub fn new(
        custody: Arc<dyn CustodyLedger>,
        config: ReconciliationConfig,
        halt: Arc<HaltSwitch>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            custody,
            supply: None,
            thresholds: Thresholds::from_config(&config),
            history: Mutex::new(BoundedHistory::new(config.history_limit)),
            config,
            halt,
            alerts: AlertBook::new(),
            retry,
            clock,
            events,
            metrics: None,
        }
    }

    /// Measure issued supply from the token ledger instead of custody's own figure
    pub fn with_supply_ledger(mut self, ledger: Arc<dyn TokenLedger>) -> Self {
        self.supply = Some(ledger);
        self
    }

    /// Record checks in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Halt switch shared with the orchestrator
    pub fn halt(&self) -> &Arc<HaltSwitch> {
        &self.halt
    }

    /// Run one check
    pub async fn run_check(&self, trigger: CheckTrigger) -> Result<ReconciliationResult> {
        let (custody_total, issued_total) = match self.measure().await {
            Ok(totals) => totals,
            Err(e) => {
                error!(error = %e, trigger = ?trigger, "Reconciliation check could not read totals");
                if let Some(metrics) = &self.metrics {
                    metrics.record_reconciliation_failure();
                }
                return Err(e);
            }
        };

        let now = self.clock.now();
        let assessment = self.thresholds.assess(custody_total, issued_total);
        let id = Uuid::new_v4();

        let alert = assessment.severity.map(|severity| {
            self.alerts.raise(
                id,
                severity,
                custody_total,
                issued_total,
                assessment.discrepancy_pct,
                now,
            )
        });

        let result = ReconciliationResult {
            id,
            custody_total,
            issued_total,
            discrepancy_abs: assessment.discrepancy_abs,
            discrepancy_pct: assessment.discrepancy_pct,
            tolerance_pct: self.thresholds.tolerance_pct,
            status: assessment.status,
            trigger,
            alert_id: alert.as_ref().map(|a| a.id),
            checked_at: now,
        };

        self.history.lock().push(result.clone());

        if let Some(metrics) = &self.metrics {
            metrics.record_reconciliation(
                result.status.as_str(),
                result.discrepancy_pct.to_f64().unwrap_or(0.0),
            );
        }

        if let Some(alert) = &alert {
            self.events.publish(Event::DiscrepancyDetected {
                alert_id: alert.id,
                severity: alert.severity,
                status: result.status,
                discrepancy_pct: result.discrepancy_pct,
                at: now,
            });
        }

        match result.status {
            ReconciliationStatus::Consistent => info!(
                custody = %custody_total,
                issued = %issued_total,
                discrepancy_pct = %result.discrepancy_pct,
                "Reserves consistent"
            ),
            ReconciliationStatus::MinorDiscrepancy => warn!(
                custody = %custody_total,
                issued = %issued_total,
                discrepancy_pct = %result.discrepancy_pct,
                "Reserve discrepancy above tolerance"
            ),
            ReconciliationStatus::Halted => {
                self.halt.raise(
                    format!(
                        "reserve discrepancy {}% exceeds halt threshold {}%",
                        result.discrepancy_pct.round_dp(4),
                        self.thresholds.halt_pct
                    ),
                    now,
                );
            }
        }

        Ok(result)
    }

    async fn measure(&self) -> Result<(Amount, Amount)> {
        let totals = self
            .retry
            .execute("custody.get_totals", || self.custody.get_totals())
            .await?;

        let issued_total = match &self.supply {
            Some(ledger) => {
                self.retry
                    .execute("token.total_supply", || ledger.total_supply())
                    .await?
            }
            None => totals.issued_total,
        };

        Ok((totals.custody_total, issued_total))
    }

    /// Up to `limit` results, newest first
    pub fn history(&self, limit: usize) -> Vec<ReconciliationResult> {
        self.history.lock().recent(limit)
    }

    /// Newest result
    pub fn latest(&self) -> Option<ReconciliationResult> {
        self.history.lock().latest().cloned()
    }

    /// Unacknowledged alerts
    pub fn active_alerts(&self) -> Vec<DiscrepancyAlert> {
        self.alerts.active()
    }

    /// Acknowledge an alert
    pub fn acknowledge_alert(&self, id: Uuid, by: &str) -> Result<DiscrepancyAlert> {
        self.alerts.acknowledge(id, by, self.clock.now())
    }

    /// Run `Scheduled` checks every `interval_secs` until `shutdown` flips to true
    pub fn spawn_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Reconciliation loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_check(CheckTrigger::Scheduled).await {
                            error!(error = %e, "Scheduled reconciliation failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Reconciliation loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
