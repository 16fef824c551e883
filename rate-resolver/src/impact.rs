//! Size-based price impact

use crate::BPS_SCALE;
use reserve_core::config::RateConfig;
use reserve_core::Amount;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Price impact schedule
///
/// Zero up to `notional`; above it, `bps_per_notional` for every notional
/// multiple of the amount, capped at `max_bps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceImpact {
    notional: Amount,
    bps_per_notional: u32,
    max_bps: u32,
}

impl PriceImpact {
    /// Create a schedule
    pub fn new(notional: Amount, bps_per_notional: u32, max_bps: u32) -> Self {
        Self {
            notional,
            bps_per_notional,
            max_bps,
        }
    }

    /// Schedule from the rate section
    pub fn from_config(config: &RateConfig) -> Self {
        Self::new(
            config.impact_notional,
            config.impact_bps_per_notional,
            config.max_impact_bps,
        )
    }

    /// Impact in basis points for `amount`
    pub fn bps(&self, amount: Amount) -> u32 {
        if self.notional <= Decimal::ZERO || amount <= self.notional {
            return 0;
        }
        let multiples = amount / self.notional;
        let cap = Decimal::from(self.max_bps);
        let raw = multiples
            .checked_mul(Decimal::from(self.bps_per_notional))
            .map(|bps| bps.floor())
            .unwrap_or(cap);
        let capped = raw.min(cap);
        capped.to_u32().unwrap_or(self.max_bps)
    }

    /// Apply `bps` against `rate`
    pub fn apply(rate: Decimal, bps: u32) -> Decimal {
        rate * (Decimal::ONE - Decimal::from(bps) / Decimal::from(BPS_SCALE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn schedule() -> PriceImpact {
        PriceImpact::new(dec!(1_000_000_000), 25, 300)
    }

    #[test]
    fn test_no_impact_up_to_notional() {
        assert_eq!(schedule().bps(dec!(1)), 0);
        assert_eq!(schedule().bps(dec!(1_000_000_000)), 0);
    }

    #[test]
    fn test_impact_grows_with_size() {
        let s = schedule();
        assert_eq!(s.bps(dec!(2_000_000_000)), 50);
        assert_eq!(s.bps(dec!(4_000_000_000)), 100);
        assert!(s.bps(dec!(3_000_000_000)) > s.bps(dec!(2_000_000_000)));
    }

    #[test]
    fn test_impact_is_capped() {
        assert_eq!(schedule().bps(dec!(1_000_000_000_000)), 300);
    }

    #[test]
    fn test_apply() {
        assert_eq!(PriceImpact::apply(dec!(100), 50), dec!(99.5));
    }
}
