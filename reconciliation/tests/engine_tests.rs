//! Reconciliation engine and proof scheduler against the in-memory custody

use chrono::Duration;
use reconciliation::{
    CheckTrigger, HaltSwitch, ProofScheduler, ProofStatus, ProtectiveMeasure,
    ReconciliationEngine,
};
use reserve_core::config::{ProofConfig, ReconciliationConfig, RetryConfig};
use reserve_core::mock::{Fault, MockCustodyLedger, MockTokenLedger};
use reserve_core::{
    AccountId, AlertSeverity, Clock, Error, Event, EventBus, ManualClock, Metrics,
    ReconciliationStatus, RetryPolicy,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::watch;

fn retry() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_retries: 1,
        initial_delay_ms: 1,
        jitter_factor: 0.0,
        call_timeout_ms: 100,
        ..RetryConfig::default()
    })
}

struct Harness {
    custody: Arc<MockCustodyLedger>,
    halt: Arc<HaltSwitch>,
    events: EventBus,
    clock: Arc<ManualClock>,
    engine: Arc<ReconciliationEngine>,
}

fn harness(custody: MockCustodyLedger, config: ReconciliationConfig) -> Harness {
    let custody = Arc::new(custody);
    let events = EventBus::new(64);
    let halt = Arc::new(HaltSwitch::new(events.clone()));
    let clock = Arc::new(ManualClock::starting_now());
    let engine = Arc::new(ReconciliationEngine::new(
        custody.clone(),
        config,
        halt.clone(),
        retry(),
        clock.clone(),
        events.clone(),
    ));
    Harness {
        custody,
        halt,
        events,
        clock,
        engine,
    }
}

#[tokio::test]
async fn test_consistent_reserves_raise_nothing() {
    let h = harness(
        MockCustodyLedger::with_totals(dec!(100_000_000), dec!(100_000_000)),
        ReconciliationConfig::default(),
    );

    let result = h.engine.run_check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::Consistent);
    assert_eq!(result.alert_id, None);
    assert!(h.engine.active_alerts().is_empty());
    assert!(!h.halt.is_halted());
}

#[tokio::test]
async fn test_minor_discrepancy_alerts_without_halt() {
    let h = harness(
        MockCustodyLedger::with_totals(dec!(97_500_000), dec!(100_000_000)),
        ReconciliationConfig::default(),
    );

    let result = h.engine.run_check(CheckTrigger::Scheduled).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::MinorDiscrepancy);
    assert_eq!(result.discrepancy_pct, dec!(2.5));

    let alerts = h.engine.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    assert_eq!(alerts[0].measure, ProtectiveMeasure::Investigate);
    assert!(!h.halt.is_halted());
}

#[tokio::test]
async fn test_breach_sets_halt_until_cleared() {
    let h = harness(
        MockCustodyLedger::with_totals(dec!(100_000_000), dec!(100_000_000)),
        ReconciliationConfig::default(),
    );
    let mut rx = h.events.subscribe();

    h.custody.adjust_custody(dec!(-6_000_000));
    let result = h.engine.run_check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::Halted);
    assert!(h.halt.is_halted());

    let mut saw_halt = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::HaltRaised { .. } = event {
            saw_halt = true;
        }
    }
    assert!(saw_halt);

    // restoring custody does not clear the flag by itself
    h.custody.adjust_custody(dec!(6_000_000));
    let result = h.engine.run_check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::Consistent);
    assert!(h.halt.is_halted());

    h.halt.clear("ops", h.clock.now()).unwrap();
    assert!(!h.halt.is_halted());
}

#[tokio::test]
async fn test_alerts_persist_until_acknowledged() {
    let h = harness(
        MockCustodyLedger::with_totals(dec!(98_500_000), dec!(100_000_000)),
        ReconciliationConfig::default(),
    );
    h.engine.run_check(CheckTrigger::Manual).await.unwrap();

    // a later consistent check leaves the alert open
    h.custody.adjust_custody(dec!(1_500_000));
    h.engine.run_check(CheckTrigger::Manual).await.unwrap();
    let alerts = h.engine.active_alerts();
    assert_eq!(alerts.len(), 1);

    let acked = h.engine.acknowledge_alert(alerts[0].id, "ops").unwrap();
    assert!(acked.acknowledged);
    assert!(h.engine.active_alerts().is_empty());
}

#[tokio::test]
async fn test_history_is_bounded() {
    let h = harness(
        MockCustodyLedger::with_totals(dec!(10), dec!(10)),
        ReconciliationConfig {
            history_limit: 5,
            ..ReconciliationConfig::default()
        },
    );

    for _ in 0..12 {
        h.engine.run_check(CheckTrigger::Scheduled).await.unwrap();
    }
    let history = h.engine.history(100);
    assert_eq!(history.len(), 5);
    assert!(history[0].checked_at >= history[4].checked_at);
    assert_eq!(h.engine.latest().unwrap().id, history[0].id);
}

#[tokio::test]
async fn test_unreadable_totals_fail_the_check() {
    let metrics = Metrics::new().unwrap();
    let custody = Arc::new(MockCustodyLedger::with_totals(dec!(10), dec!(10)));
    custody.faults.inject(
        "get_totals",
        Fault::Permanent(Error::Unavailable("custody api down".into())),
    );
    let events = EventBus::new(8);
    let engine = ReconciliationEngine::new(
        custody,
        ReconciliationConfig::default(),
        Arc::new(HaltSwitch::new(events.clone())),
        retry(),
        Arc::new(ManualClock::starting_now()),
        events,
    )
    .with_metrics(metrics.clone());

    assert!(engine.run_check(CheckTrigger::Manual).await.is_err());
    assert!(engine.history(10).is_empty());
    assert_eq!(metrics.reconciliation_failures.get(), 1);
}

#[tokio::test]
async fn test_supply_ledger_is_measured_issued_total() {
    let custody = Arc::new(MockCustodyLedger::with_totals(dec!(1000), dec!(1000)));
    let token = Arc::new(MockTokenLedger::new("xBTC"));
    token.credit(&AccountId::new("alice"), dec!(800));
    let events = EventBus::new(8);
    let halt = Arc::new(HaltSwitch::new(events.clone()));
    let engine = ReconciliationEngine::new(
        custody,
        ReconciliationConfig::default(),
        halt.clone(),
        retry(),
        Arc::new(ManualClock::starting_now()),
        events,
    )
    .with_supply_ledger(token);

    let result = engine.run_check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(result.issued_total, dec!(800));
    assert_eq!(result.status, ReconciliationStatus::Halted);
    assert!(halt.is_halted());
}

#[tokio::test]
async fn test_periodic_loop_stops_on_shutdown() {
    let h = harness(
        MockCustodyLedger::with_totals(dec!(10), dec!(10)),
        ReconciliationConfig {
            interval_secs: 3600,
            ..ReconciliationConfig::default()
        },
    );
    let (tx, rx) = watch::channel(false);
    let handle = h.engine.clone().spawn_periodic(rx);

    // first tick fires immediately
    for _ in 0..50 {
        if !h.engine.history(1).is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(h.engine.history(10).len(), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_proof_expires_after_validity_window() {
    let custody = Arc::new(MockCustodyLedger::with_totals(dec!(100), dec!(100)));
    let clock = Arc::new(ManualClock::starting_now());
    let scheduler = ProofScheduler::new(
        custody,
        ProofConfig::default(),
        retry(),
        clock.clone(),
        EventBus::new(8),
    );

    let record = scheduler.generate().await.unwrap();
    assert_eq!(record.status, ProofStatus::Verified);

    clock.advance(Duration::hours(25));
    assert_eq!(record.status_at(clock.now()), ProofStatus::Expired);
    assert_eq!(scheduler.latest().unwrap().status, ProofStatus::Expired);
    assert_eq!(scheduler.verify(&record).status, ProofStatus::Expired);
}

#[tokio::test]
async fn test_proof_history_is_bounded() {
    let custody = Arc::new(MockCustodyLedger::with_totals(dec!(100), dec!(100)));
    let scheduler = ProofScheduler::new(
        custody,
        ProofConfig {
            history_limit: 3,
            ..ProofConfig::default()
        },
        retry(),
        Arc::new(ManualClock::starting_now()),
        EventBus::new(8),
    );

    for _ in 0..5 {
        scheduler.generate().await.unwrap();
    }
    assert_eq!(scheduler.history(10).len(), 3);
}
