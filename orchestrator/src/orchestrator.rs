//! Operation orchestrator
//!
//! Accepts deposit, withdrawal and exchange requests, gates them through
//! compliance and drives each through its step plan on its own task. A
//! failed step before any ledger mutation ends the operation `Failed`;
//! after one, the recorded compensations run in reverse order and the
//! operation ends `RolledBack`.
//!
//! Each in-flight operation owns an async mutex over its record. The driver
//! holds it for one step at a time, so an administrative cancel waits for
//! the current step to finish and takes effect at the next boundary.

use crate::executor::{Collaborators, StepExecutor, StepEffect};
use crate::plan::Step;
use crate::record::{Compensation, OperationParams, OperationRecord, OperationRequest, StepOutcome};
use crate::store::{Admission, OperationStore};
use compliance_gateway::{Allocation, BatchDecision, CheckRequest, ComplianceGateway, Decision};
use dashmap::DashMap;
use reconciliation::{CheckTrigger, HaltSwitch, ReconciliationEngine};
use reserve_core::config::OrchestratorConfig;
use reserve_core::{
    Clock, ComplianceCategory, Config, Error, Event, EventBus, Metrics, OperationId,
    OperationKind, OperationStatus, Result, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

/// Result of an administrative cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// No ledger was touched; the operation is now `Failed`
    Cancelled,
    /// A ledger was already mutated; rollback starts at the next step boundary
    RollbackRequested,
}

/// Record and status channel of one running operation
struct InFlight {
    record: Mutex<OperationRecord>,
    status: watch::Sender<OperationStatus>,
}

impl InFlight {
    fn new(record: OperationRecord) -> Self {
        let (status, _) = watch::channel(record.status);
        Self {
            record: Mutex::new(record),
            status,
        }
    }
}

/// Operation orchestrator
pub struct Orchestrator {
    executor: StepExecutor,
    store: Arc<dyn OperationStore>,
    halt: Arc<HaltSwitch>,
    reconciliation: Option<Arc<ReconciliationEngine>>,
    config: OrchestratorConfig,
    check_after_settlement: bool,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Option<Metrics>,
    in_flight: DashMap<OperationId, Arc<InFlight>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("in_flight", &self.in_flight.len())
            .field("halted", &self.halt.is_halted())
            .field("reserve_asset", &self.config.reserve_asset)
            .finish()
    }
}

impl Orchestrator {
    /// Create new orchestrator
    pub fn new(
        collaborators: Collaborators,
        store: Arc<dyn OperationStore>,
        halt: Arc<HaltSwitch>,
        config: &Config,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let executor = StepExecutor::new(
            collaborators,
            config.orchestrator.clone(),
            RetryPolicy::new(config.retry.clone()),
            clock.clone(),
        );
        Self {
            executor,
            store,
            halt,
            reconciliation: None,
            config: config.orchestrator.clone(),
            check_after_settlement: config.reconciliation.check_after_settlement,
            clock,
            events,
            metrics: None,
            in_flight: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.orchestrator.max_in_flight.max(1))),
        }
    }

    /// Run a post-settlement check on `engine` after deposits and withdrawals
    pub fn with_reconciliation(mut self, engine: Arc<ReconciliationEngine>) -> Self {
        self.reconciliation = Some(engine);
        self
    }

    /// Record submissions, finalisations and retries in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.executor = self.executor.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Halt switch consulted on every submission
    pub fn halt(&self) -> &Arc<HaltSwitch> {
        &self.halt
    }

    /// Compliance gateway in use
    pub fn gateway(&self) -> &Arc<ComplianceGateway> {
        &self.executor.collaborators().gateway
    }

    /// Operations currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Accept an operation
    ///
    /// Validation errors, the halt flag and compliance denials are reported
    /// here. On approval the workflow continues on its own task and the ID
    /// can be polled with [`Orchestrator::get_status`]. A deposit whose
    /// external reference already has a live record returns that record's ID.
    pub async fn submit(self: &Arc<Self>, request: OperationRequest) -> Result<OperationId> {
        let OperationRequest { account, params } = request;
        if account.is_blank() {
            return Err(Error::Validation("account must not be empty".into()));
        }
        params.validate(self.config.min_deposit_confirmations)?;
        self.ensure_ledgers(&params)?;

        if let Err(e) = self.halt.ensure_running() {
            warn!(%account, kind = %params.kind(), error = %e, "Submission rejected while halted");
            return Err(e);
        }

        let record = OperationRecord::new(account, params, self.clock.now());
        let id = record.id;
        if let Admission::Existing(existing) = self.store.admit(&record)? {
            info!(
                operation_id = %existing,
                reference = record.external_reference.as_deref().unwrap_or_default(),
                "Duplicate external reference; returning existing operation"
            );
            return Ok(existing);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_submission(record.kind.as_str());
        }
        info!(
            operation_id = %id,
            kind = %record.kind,
            account = %record.account,
            amount = %record.params.amount(),
            "Operation accepted"
        );

        let flight = Arc::new(InFlight::new(record));
        self.in_flight.insert(id, flight.clone());

        {
            let mut record = flight.record.lock().await;
            if let Err(e) = self.transition(&mut record, OperationStatus::ComplianceChecking) {
                record.failure_reason = Some(e.to_string());
                self.finish(&mut record, OperationStatus::Failed);
                return Err(e);
            }

            match self.check_compliance(&record).await {
                Ok(allocations) => {
                    record.allocations = allocations;
                    let now = self.clock.now();
                    record.complete_step(StepOutcome {
                        step: Step::ComplianceCheck,
                        attempts: 1,
                        completed_at: now,
                        compensation: None,
                        compensated: false,
                        detail: None,
                    });
                    if let Err(e) = self.persist(&record) {
                        record.failure_reason = Some(e.to_string());
                        self.finish(&mut record, OperationStatus::Failed);
                        return Err(e);
                    }
                }
                Err(e) => {
                    record.failure_reason = Some(e.to_string());
                    self.finish(&mut record, OperationStatus::Failed);
                    return Err(match e {
                        Error::ComplianceDenied { reason, .. } => Error::ComplianceDenied {
                            operation_id: Some(id),
                            reason,
                        },
                        other => other,
                    });
                }
            }
        }

        tokio::spawn(self.clone().drive(flight));
        Ok(id)
    }

    /// Current record
    pub fn get_status(&self, id: &OperationId) -> Result<OperationRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    /// Wait until the operation reaches a terminal state
    pub async fn wait_for_completion(
        &self,
        id: &OperationId,
        timeout: Duration,
    ) -> Result<OperationRecord> {
        let receiver = self.in_flight.get(id).map(|f| f.status.subscribe());
        if let Some(mut receiver) = receiver {
            let waited = tokio::time::timeout(timeout, receiver.wait_for(|s| s.is_terminal())).await;
            if waited.is_err() {
                return Err(Error::Timeout {
                    operation: format!("wait for operation {}", id.short()),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        self.get_status(id)
    }

    /// Administrative cancel
    ///
    /// Waits for the current step to finish. Succeeds outright while no
    /// ledger has been mutated; afterwards requests the normal rollback.
    pub async fn cancel(&self, id: &OperationId, by: &str) -> Result<CancelOutcome> {
        if by.trim().is_empty() {
            return Err(Error::Validation("cancel requires an operator".into()));
        }

        let flight = match self.in_flight.get(id).map(|f| f.clone()) {
            Some(flight) => flight,
            None => {
                let record = self.get_status(id)?;
                if let Some(err) = record.partial_rollback_error() {
                    return Err(err);
                }
                return Err(Error::InvalidState(format!(
                    "operation {} is {} and not running",
                    id.short(),
                    record.status
                )));
            }
        };

        let mut record = flight.record.lock().await;
        if record.status.is_terminal() {
            if let Some(err) = record.partial_rollback_error() {
                return Err(err);
            }
            return Err(Error::InvalidState(format!(
                "operation {} already {}",
                id.short(),
                record.status
            )));
        }

        let reason = Error::Cancelled(format!("cancelled by {}", by)).to_string();
        if record.has_mutated() {
            record.rollback_requested = true;
            record.failure_reason = Some(reason);
            // the driver rolls back from memory even if this write is lost
            self.persist(&record).ok();
            warn!(operation_id = %id, by, status = %record.status, "Cancel requested after ledger mutation; rolling back");
            Ok(CancelOutcome::RollbackRequested)
        } else {
            record.failure_reason = Some(reason);
            self.finish(&mut record, OperationStatus::Failed);
            info!(operation_id = %id, by, "Operation cancelled before any ledger mutation");
            Ok(CancelOutcome::Cancelled)
        }
    }

    /// Resume non-terminal records after a restart; returns how many were resumed
    ///
    /// Records that never finished compliance end `Failed`. Records that
    /// failed after a mutation, or were rolling back, resume rollback.
    /// Everything else is driven forward from its next step; collaborator
    /// calls carry per-operation references, so repeating an interrupted
    /// step is safe.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let records = self.store.unfinished()?;
        let mut resumed = 0;

        for mut record in records {
            if self.in_flight.contains_key(&record.id) {
                continue;
            }
            // compliance windows do not survive a restart
            record.allocations.clear();

            let id = record.id;
            let flight = Arc::new(InFlight::new(record));
            self.in_flight.insert(id, flight.clone());

            {
                let mut record = flight.record.lock().await;
                if record.next_step == 0 {
                    record.failure_reason = Some("interrupted before compliance approval".into());
                    self.finish(&mut record, OperationStatus::Failed);
                    continue;
                }
                if record.failure_reason.is_some() {
                    if !record.has_mutated() {
                        self.finish(&mut record, OperationStatus::Failed);
                        continue;
                    }
                    record.rollback_requested = true;
                }
                info!(
                    operation_id = %id,
                    status = %record.status,
                    next_step = record.next_step,
                    rollback = record.rollback_requested,
                    "Resuming operation"
                );
            }

            tokio::spawn(self.clone().drive(flight));
            resumed += 1;
        }

        if resumed > 0 {
            info!(resumed, "Recovered unfinished operations");
        }
        Ok(resumed)
    }

    async fn drive(self: Arc<Self>, flight: Arc<InFlight>) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Operation permits closed; driver not started");
                return;
            }
        };

        let completed = loop {
            let mut record = flight.record.lock().await;
            if record.status.is_terminal() {
                break None;
            }
            if record.status == OperationStatus::RollingBack || record.rollback_requested {
                self.roll_back(&mut record).await;
                break None;
            }

            let Some(step) = record.next() else {
                self.finish(&mut record, OperationStatus::Completed);
                break Some(record.clone());
            };

            // no step starts until the previous outcome is stored
            let executed = match self.transition(&mut record, step.status()) {
                Ok(()) => self.executor.execute(step, &record).await,
                Err(e) => Err(e),
            };
            let applied = match executed {
                Ok(effect) => self.apply(&mut record, step, effect),
                Err(e) => Err(e),
            };
            if let Err(e) = applied {
                self.fail_step(&mut record, step, e).await;
                break None;
            }
        };

        if let Some(record) = completed {
            self.reconcile_after(&record).await;
        }
    }

    async fn check_compliance(&self, record: &OperationRecord) -> Result<Vec<Allocation>> {
        let gateway = self.gateway();
        let correlation_id = record.id.to_string();
        let amount = record.params.amount();

        match &record.params {
            OperationParams::Exchange { .. } => {
                // each party is tracked against its own tier
                let mut legs = vec![CheckRequest {
                    account: record.account.clone(),
                    category: ComplianceCategory::Exchange,
                    amount,
                }];
                let destination = record.exchange_destination();
                if destination != &record.account {
                    legs.push(CheckRequest {
                        account: destination.clone(),
                        category: ComplianceCategory::Exchange,
                        amount,
                    });
                }
                match gateway.check_all(&legs, Some(&correlation_id)).await? {
                    BatchDecision::Approved(allocations) => Ok(allocations),
                    BatchDecision::Denied { account, reason } => {
                        warn!(operation_id = %record.id, %account, %reason, "Exchange denied by compliance");
                        Err(Error::ComplianceDenied {
                            operation_id: Some(record.id),
                            reason,
                        })
                    }
                }
            }
            _ => {
                let decision = gateway
                    .check(
                        &record.account,
                        record.kind.category(),
                        amount,
                        Some(&correlation_id),
                    )
                    .await?;
                match decision {
                    Decision::Approved(allocation) => Ok(vec![allocation]),
                    Decision::Denied(reason) => {
                        warn!(operation_id = %record.id, %reason, "Operation denied by compliance");
                        Err(Error::ComplianceDenied {
                            operation_id: Some(record.id),
                            reason,
                        })
                    }
                }
            }
        }
    }

    fn apply(&self, record: &mut OperationRecord, step: Step, effect: StepEffect) -> Result<()> {
        if let Some(quote) = effect.quote {
            record.quote = Some(quote);
        }
        if let Some(reference) = effect.external_reference {
            record.external_reference = Some(reference);
        }
        record.complete_step(StepOutcome {
            step,
            attempts: effect.attempts,
            completed_at: self.clock.now(),
            compensation: effect.compensation,
            compensated: false,
            detail: effect.detail,
        });
        self.persist(record)?;
        debug!(operation_id = %record.id, %step, attempts = effect.attempts, "Step completed");
        Ok(())
    }

    async fn fail_step(&self, record: &mut OperationRecord, step: Step, error: Error) {
        record.failure_reason = Some(format!("{} failed: {}", step, error));
        if record.has_mutated() {
            warn!(
                operation_id = %record.id,
                %step,
                error = %error,
                class = ?error.class(),
                "Step failed after ledger mutation; rolling back"
            );
            self.roll_back(record).await;
        } else {
            warn!(
                operation_id = %record.id,
                %step,
                error = %error,
                class = ?error.class(),
                "Step failed before any ledger mutation"
            );
            self.finish(record, OperationStatus::Failed);
        }
    }

    /// Apply recorded compensations in reverse order
    ///
    /// A failed compensation is logged and skipped so the remaining ones
    /// still run. An irreversible step stops the walk: everything before it
    /// stays in place for manual reconciliation.
    async fn roll_back(&self, record: &mut OperationRecord) {
        // store failures are logged; compensation proceeds from memory
        if record.status != OperationStatus::RollingBack {
            self.transition(record, OperationStatus::RollingBack).ok();
        }

        for index in (0..record.steps.len()).rev() {
            let outcome = &record.steps[index];
            if outcome.compensated {
                continue;
            }
            let (step, compensation) = match &outcome.compensation {
                Some(compensation) => (outcome.step, compensation.clone()),
                None => continue,
            };

            if let Compensation::Irreversible { detail } = &compensation {
                error!(
                    operation_id = %record.id,
                    %step,
                    detail = %detail,
                    "Rollback stopped at irreversible step; manual reconciliation required"
                );
                record.partial_rollback = true;
                record
                    .rollback_failures
                    .push(format!("{}: irreversible ({})", step, detail));
                self.persist(record).ok();
                break;
            }

            let outcome = self.executor.compensate(&compensation).await;
            match outcome.result {
                Ok(()) => {
                    record.steps[index].compensated = true;
                    info!(
                        operation_id = %record.id,
                        %step,
                        action = compensation.as_str(),
                        attempts = outcome.attempts,
                        "Compensation applied"
                    );
                }
                Err(e) => {
                    error!(
                        operation_id = %record.id,
                        %step,
                        action = compensation.as_str(),
                        attempts = outcome.attempts,
                        error = %e,
                        "Compensation failed; continuing rollback"
                    );
                    record.partial_rollback = true;
                    record.rollback_failures.push(format!(
                        "{} ({}): {}",
                        step,
                        compensation.as_str(),
                        e
                    ));
                }
            }
            record.updated_at = self.clock.now();
            self.persist(record).ok();
        }

        self.finish(record, OperationStatus::RolledBack);
    }

    fn finish(&self, record: &mut OperationRecord, status: OperationStatus) {
        self.transition(record, status).ok();

        // usage stays charged while any ledger effect remains in place
        let reversed = match status {
            OperationStatus::Failed => true,
            OperationStatus::RolledBack => record.fully_compensated(),
            _ => false,
        };
        if reversed {
            self.gateway().release_all(&record.allocations);
        } else if status != OperationStatus::Completed && !record.allocations.is_empty() {
            warn!(
                operation_id = %record.id,
                "Ledger effects remain after rollback; compliance usage kept"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_finalized(record.kind.as_str(), status.as_str(), record.partial_rollback);
        }
        self.events.publish(Event::OperationFinalized {
            operation_id: record.id,
            kind: record.kind,
            status,
            partial_rollback: record.partial_rollback,
            reason: record.failure_reason.clone(),
            at: record.updated_at,
        });

        match status {
            OperationStatus::Completed => info!(
                operation_id = %record.id,
                kind = %record.kind,
                account = %record.account,
                "Operation completed"
            ),
            _ if record.partial_rollback => error!(
                operation_id = %record.id,
                kind = %record.kind,
                failures = ?record.rollback_failures,
                "Operation partially rolled back; manual reconciliation required"
            ),
            _ => warn!(
                operation_id = %record.id,
                kind = %record.kind,
                %status,
                reason = record.failure_reason.as_deref().unwrap_or_default(),
                "Operation did not complete"
            ),
        }

        self.in_flight.remove(&record.id);
    }

    fn transition(&self, record: &mut OperationRecord, to: OperationStatus) -> Result<()> {
        let from = record.status;
        record.status = to;
        record.updated_at = self.clock.now();
        let saved = self.persist(record);

        debug!(operation_id = %record.id, kind = %record.kind, %from, %to, "Operation transitioned");
        self.events.publish(Event::OperationTransitioned {
            operation_id: record.id,
            kind: record.kind,
            from,
            to,
            at: record.updated_at,
        });
        if let Some(flight) = self.in_flight.get(&record.id) {
            flight.status.send_replace(to);
        }
        saved
    }

    fn persist(&self, record: &OperationRecord) -> Result<()> {
        self.store.save(record).map_err(|e| {
            error!(operation_id = %record.id, error = %e, "Failed to persist operation record");
            e
        })
    }

    fn ensure_ledgers(&self, params: &OperationParams) -> Result<()> {
        let collaborators = self.executor.collaborators();
        match params {
            OperationParams::Exchange {
                from_asset,
                to_asset,
                ..
            } => {
                collaborators.ledger(from_asset)?;
                collaborators.ledger(to_asset)?;
            }
            _ => {
                collaborators.ledger(&self.executor.reserve_asset())?;
            }
        }
        Ok(())
    }

    async fn reconcile_after(&self, record: &OperationRecord) {
        if !self.check_after_settlement || record.kind == OperationKind::Exchange {
            return;
        }
        let Some(engine) = &self.reconciliation else {
            return;
        };
        match engine
            .run_check(CheckTrigger::PostSettlement {
                operation_id: record.id,
            })
            .await
        {
            Ok(result) => debug!(
                operation_id = %record.id,
                status = result.status.as_str(),
                discrepancy_pct = %result.discrepancy_pct,
                "Post-settlement reconciliation"
            ),
            Err(e) => warn!(operation_id = %record.id, error = %e, "Post-settlement reconciliation failed"),
        }
    }
}
