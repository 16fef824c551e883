//! Administrative cancel and restart recovery

mod common;

use chrono::{DateTime, Utc};
use common::{deposit, test_config, Harness, Rig};
use orchestrator::{
    Admission, CancelOutcome, Compensation, InMemoryStore, OperationParams, OperationRecord,
    OperationStore, Step, StepOutcome,
};
use reserve_core::mock::Fault;
use reserve_core::{
    AccountId, Clock, CustodyLedger, Error, OperationId, OperationStatus, Tier, TokenLedger,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Store that refuses the write recording one step's completion
struct FailingStore {
    inner: InMemoryStore,
    fail_after: Mutex<Option<Step>>,
}

impl FailingStore {
    fn failing_after(step: Step) -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_after: Mutex::new(Some(step)),
        }
    }
}

impl OperationStore for FailingStore {
    fn admit(&self, record: &OperationRecord) -> reserve_core::Result<Admission> {
        self.inner.admit(record)
    }

    fn save(&self, record: &OperationRecord) -> reserve_core::Result<()> {
        let mut fail_after = self.fail_after.lock().unwrap();
        let last = record.steps.last().map(|s| s.step);
        if last.is_some() && last == *fail_after {
            *fail_after = None;
            return Err(Error::Storage("disk full".into()));
        }
        self.inner.save(record)
    }

    fn get(&self, id: &OperationId) -> reserve_core::Result<Option<OperationRecord>> {
        self.inner.get(id)
    }

    fn unfinished(&self) -> reserve_core::Result<Vec<OperationRecord>> {
        self.inner.unfinished()
    }

    fn count(&self) -> reserve_core::Result<usize> {
        self.inner.count()
    }
}

fn deposit_params(amount: Decimal, reference: &str) -> OperationParams {
    OperationParams::Deposit {
        amount,
        external_reference: reference.to_string(),
        confirmations: 6,
    }
}

fn complete(
    record: &mut OperationRecord,
    step: Step,
    compensation: Option<Compensation>,
    at: DateTime<Utc>,
) {
    record.complete_step(StepOutcome {
        step,
        attempts: 1,
        completed_at: at,
        compensation,
        compensated: false,
        detail: None,
    });
}

/// A deposit interrupted after custody registration, before minting
async fn registered_deposit(
    rig: &Rig,
    account: &AccountId,
    amount: Decimal,
    reference: &str,
) -> OperationRecord {
    let now = rig.clock.now();
    let mut record = OperationRecord::new(account.clone(), deposit_params(amount, reference), now);
    complete(&mut record, Step::ComplianceCheck, None, now);
    complete(&mut record, Step::ValidateExternal, None, now);
    rig.custody.register_deposit(reference, amount, 6).await.unwrap();
    complete(
        &mut record,
        Step::RegisterReserve,
        Some(Compensation::CancelDeposit {
            reference: reference.to_string(),
        }),
        now,
    );
    record.status = OperationStatus::Minting;
    rig.store.save(&record).unwrap();
    record
}

/// One permit, and a first operation holding it on a hung custody call
async fn blocked_harness() -> Harness {
    let mut config = test_config();
    config.orchestrator.max_in_flight = 1;
    config.retry.max_retries = 0;
    config.retry.call_timeout_ms = 1_000;
    let h = Harness::with_config(config);
    let alice = h.account("alice", Tier::Tier2);

    h.custody.faults.inject("confirmations", Fault::Hang);
    h.submit(deposit(&alice, dec!(1_000), "btc-blocker")).await.unwrap();
    for _ in 0..200 {
        if h.custody.faults.call_count("confirmations") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.custody.faults.call_count("confirmations"), 1);
    h
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_mutation() {
    let h = blocked_harness().await;
    let bob = h.account("bob", Tier::Tier2);

    let queued = h.submit(deposit(&bob, dec!(2_000), "btc-queued")).await.unwrap();
    let outcome = h.orchestrator.cancel(&queued, "ops-oncall").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let record = h.orchestrator.get_status(&queued).unwrap();
    assert_eq!(record.status, OperationStatus::Failed);
    assert!(record.failure_reason.unwrap().contains("ops-oncall"));

    let again = h.orchestrator.cancel(&queued, "ops-oncall").await.unwrap_err();
    assert!(matches!(again, Error::InvalidState(_)));

    assert_eq!(h.custody.faults.call_count("register_deposit"), 0);
    assert!(!h.custody.is_deposit_registered("btc-queued"));
}

#[tokio::test]
async fn test_cancel_requires_operator() {
    let h = Harness::new();
    let alice = h.account("alice", Tier::Tier2);
    let id = h.submit(deposit(&alice, dec!(1_000), "btc-op")).await.unwrap();

    let err = h.orchestrator.cancel(&id, "  ").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_mutation_rolls_back() {
    let h = blocked_harness().await;
    let carol = h.account("carol", Tier::Tier2);
    let record = registered_deposit(&h, &carol, dec!(3_000_000), "btc-mid").await;

    // the blocker is already in flight, so only the seeded record resumes
    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);

    let outcome = h.orchestrator.cancel(&record.id, "ops-oncall").await.unwrap();
    assert_eq!(outcome, CancelOutcome::RollbackRequested);

    let finished = h.wait(&record.id).await;
    assert_eq!(finished.status, OperationStatus::RolledBack);
    assert!(!finished.partial_rollback);
    assert!(!h.custody.is_deposit_registered("btc-mid"));
    assert_eq!(h.btc.balance_of(&carol), dec!(0));
}

#[tokio::test]
async fn test_recover_resumes_unfinished_operations() {
    let rig = Rig::new(test_config());
    let alice = rig.account("alice", Tier::Tier2);
    let now = rig.clock.now();

    let stalled = OperationRecord::new(alice.clone(), deposit_params(dec!(1_000), "btc-r1"), now);
    rig.store.save(&stalled).unwrap();

    let midway = registered_deposit(&rig, &alice, dec!(5_000_000), "btc-r2").await;

    let mut failing = registered_deposit(&rig, &alice, dec!(7_000_000), "btc-r3").await;
    failing.failure_reason = Some("mint failed: injected".into());
    rig.store.save(&failing).unwrap();

    let orchestrator = rig.orchestrator();
    assert_eq!(orchestrator.recover().await.unwrap(), 2);

    let stalled = orchestrator.get_status(&stalled.id).unwrap();
    assert_eq!(stalled.status, OperationStatus::Failed);

    let wait = Duration::from_secs(10);
    let midway = orchestrator.wait_for_completion(&midway.id, wait).await.unwrap();
    assert_eq!(midway.status, OperationStatus::Completed);
    assert_eq!(rig.btc.balance_of(&alice), dec!(5_000_000));

    let failing = orchestrator.wait_for_completion(&failing.id, wait).await.unwrap();
    assert_eq!(failing.status, OperationStatus::RolledBack);
    assert!(!rig.custody.is_deposit_registered("btc-r3"));
    assert!(rig.custody.is_deposit_registered("btc-r2"));
}

#[tokio::test]
async fn test_recover_is_idempotent_for_finished_records() {
    let h = Harness::new();
    let alice = h.account("alice", Tier::Tier2);
    h.fund(&alice, dec!(1_000_000), "btc-done").await;

    let restarted = h.rig.orchestrator();
    assert_eq!(restarted.recover().await.unwrap(), 0);
    assert_eq!(h.btc.balance_of(&alice), dec!(1_000_000));
}

#[tokio::test]
async fn test_repeated_mint_after_restart_is_not_doubled() {
    let rig = Rig::new(test_config());
    let alice = rig.account("alice", Tier::Tier2);
    let record = registered_deposit(&rig, &alice, dec!(4_000_000), "btc-r4").await;

    // the mint landed but the crash came before the step was recorded
    rig.btc
        .mint(&alice, dec!(4_000_000), &record.reference(Step::Mint.as_str()))
        .await
        .unwrap();

    let orchestrator = rig.orchestrator();
    assert_eq!(orchestrator.recover().await.unwrap(), 1);
    let finished = orchestrator
        .wait_for_completion(&record.id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(finished.status, OperationStatus::Completed);
    assert_eq!(rig.btc.balance_of(&alice), dec!(4_000_000));
}

#[tokio::test]
async fn test_unsaved_mint_is_rolled_back_before_next_step() {
    let rig = Rig::new(test_config());
    let alice = rig.account("alice", Tier::Tier2);
    let store = Arc::new(FailingStore::failing_after(Step::Mint));
    let orchestrator = rig.orchestrator_with_store(store.clone());

    let id = orchestrator
        .submit(deposit(&alice, dec!(2_000_000), "btc-unsaved"))
        .await
        .unwrap();
    let record = orchestrator
        .wait_for_completion(&id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(record.status, OperationStatus::RolledBack);
    assert!(!record.partial_rollback);
    assert!(record.failure_reason.unwrap().contains("disk full"));
    assert_eq!(rig.btc.balance_of(&alice), dec!(0));
    assert!(!rig.custody.is_deposit_registered("btc-unsaved"));
    // the audit step never ran
    assert_eq!(rig.registry.faults.call_count("register_event"), 0);
    assert!(store.unfinished().unwrap().is_empty());
}
