//! Property-based tests for the threshold ladder and bounded history
//!
//! - Halt exactly when the discrepancy exceeds the halt threshold
//! - Severity never decreases as the discrepancy grows
//! - History never holds more than its capacity, newest first

use proptest::prelude::*;
use reconciliation::{BoundedHistory, Thresholds};
use reserve_core::config::ReconciliationConfig;
use reserve_core::{Amount, ReconciliationStatus};
use rust_decimal::Decimal;

fn amount_strategy() -> impl Strategy<Value = Amount> {
    (0u64..2_000_000_000u64).prop_map(Decimal::from)
}

proptest! {
    #[test]
    fn prop_halt_iff_above_halt_threshold(
        custody in amount_strategy(),
        issued in amount_strategy(),
    ) {
        let thresholds = Thresholds::from_config(&ReconciliationConfig::default());
        let assessment = thresholds.assess(custody, issued);

        let halted = assessment.status == ReconciliationStatus::Halted;
        prop_assert_eq!(halted, assessment.discrepancy_pct > thresholds.halt_pct);
        prop_assert_eq!(
            assessment.severity.is_none(),
            assessment.discrepancy_pct <= thresholds.tolerance_pct
        );
        prop_assert_eq!(assessment.discrepancy_abs, (custody - issued).abs());
    }

    #[test]
    fn prop_severity_is_monotonic(
        issued in 1u64..1_000_000_000u64,
        a in 0u64..200_000_000u64,
        b in 0u64..200_000_000u64,
    ) {
        let thresholds = Thresholds::from_config(&ReconciliationConfig::default());
        let issued = Decimal::from(issued);
        let (small, large) = if a <= b { (a, b) } else { (b, a) };

        let lower = thresholds.assess(issued + Decimal::from(small), issued);
        let higher = thresholds.assess(issued + Decimal::from(large), issued);
        prop_assert!(lower.discrepancy_pct <= higher.discrepancy_pct);
        prop_assert!(lower.severity <= higher.severity);
    }

    #[test]
    fn prop_history_is_bounded(
        capacity in 1usize..50,
        entries in prop::collection::vec(any::<u32>(), 0..200),
    ) {
        let mut history = BoundedHistory::new(capacity);
        for entry in &entries {
            history.push(*entry);
        }

        prop_assert!(history.len() <= capacity);
        prop_assert_eq!(history.len(), entries.len().min(capacity));
        if let Some(last) = entries.last() {
            prop_assert_eq!(history.latest(), Some(last));
            prop_assert_eq!(history.recent(1), vec![*last]);
        }
    }
}
