//! Property-based tests for limit enforcement
//!
//! - Sum of approved amounts in one rolling window never exceeds the ceiling
//! - Concurrent checks for one account cannot both pass a stale check

use compliance_gateway::{ComplianceGateway, Decision, WindowBook};
use chrono::{Duration, Utc};
use proptest::prelude::*;
use reserve_core::config::{Ceiling, ComplianceConfig, RetryConfig};
use reserve_core::mock::MockComplianceRegistry;
use reserve_core::{AccountId, Amount, ComplianceCategory, EventBus, ManualClock, RetryPolicy, Tier};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Strategy for generating amounts in base units
fn amount_strategy() -> impl Strategy<Value = Amount> {
    (1u64..4_000_000u64).prop_map(Decimal::from)
}

proptest! {
    #[test]
    fn prop_sequential_charges_respect_daily_ceiling(
        amounts in prop::collection::vec(amount_strategy(), 1..60),
        offsets in prop::collection::vec(0i64..23 * 60, 1..60),
    ) {
        let book = WindowBook::new(Duration::hours(24), Duration::days(30), Decimal::new(8, 1));
        let ceiling = Ceiling::new(Decimal::from(10_000_000u64), Decimal::from(100_000_000u64));
        let account = AccountId::new("prop");
        let start = Utc::now();

        let mut approved = Decimal::ZERO;
        for (i, amount) in amounts.iter().enumerate() {
            // every timestamp falls inside the first 23h, so one window
            let at = start + Duration::minutes(offsets[i % offsets.len()]);
            if book.charge(&account, ComplianceCategory::Deposit, *amount, ceiling, at).is_ok() {
                approved += *amount;
            }
        }

        prop_assert!(approved <= ceiling.daily);
    }

    #[test]
    fn prop_concurrent_checks_never_exceed_ceiling(
        amounts in prop::collection::vec(amount_strategy(), 2..40),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let approved = runtime.block_on(async move {
            let registry = Arc::new(MockComplianceRegistry::new());
            let account = AccountId::new("racer");
            registry.set_tier(&account, Tier::Tier1);

            let gateway = Arc::new(ComplianceGateway::new(
                registry,
                ComplianceConfig::default(),
                RetryPolicy::new(RetryConfig::default()),
                Arc::new(ManualClock::starting_now()),
                EventBus::new(16),
            ));

            let handles: Vec<_> = amounts
                .into_iter()
                .map(|amount| {
                    let gateway = gateway.clone();
                    let account = account.clone();
                    tokio::spawn(async move {
                        match gateway
                            .check(&account, ComplianceCategory::Withdrawal, amount, None)
                            .await
                        {
                            Ok(Decision::Approved(a)) => a.amount,
                            _ => Decimal::ZERO,
                        }
                    })
                })
                .collect();

            let mut total = Decimal::ZERO;
            for handle in handles {
                total += handle.await.unwrap();
            }
            total
        });

        // Tier1 withdrawal daily ceiling
        prop_assert!(approved <= Decimal::from(10_000_000u64));
    }
}
