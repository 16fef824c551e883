//! Tier limit lookup

use reserve_core::config::{Ceiling, ComplianceConfig, MinimumTiers, TierLimits};
use reserve_core::{ComplianceCategory, DenialReason, Tier};

/// Ceilings and minimum tiers from configuration
#[derive(Debug, Clone)]
pub struct LimitTable {
    limits: TierLimits,
    minimum_tiers: MinimumTiers,
}

impl LimitTable {
    /// Create new limit table
    pub fn new(limits: TierLimits, minimum_tiers: MinimumTiers) -> Self {
        Self {
            limits,
            minimum_tiers,
        }
    }

    /// Limit table from the compliance section
    pub fn from_config(config: &ComplianceConfig) -> Self {
        Self::new(config.limits, config.minimum_tiers)
    }

    /// Ceiling for a tier and category
    pub fn ceiling(&self, tier: Tier, category: ComplianceCategory) -> Ceiling {
        self.limits.ceiling(tier, category)
    }

    /// Check tier against the category minimum
    pub fn check_tier(
        &self,
        tier: Tier,
        category: ComplianceCategory,
    ) -> std::result::Result<Ceiling, DenialReason> {
        let required = self.minimum_tiers.for_category(category);
        let ceiling = self.ceiling(tier, category);
        if tier < required {
            return Err(DenialReason::TierTooLow { tier, required });
        }
        // configured tier with no allowance for this category
        if ceiling.is_closed() {
            let next = Tier::from_level(tier.level() + 1).unwrap_or(Tier::Tier3);
            return Err(DenialReason::TierTooLow {
                tier,
                required: next,
            });
        }
        Ok(ceiling)
    }
}

impl Default for LimitTable {
    fn default() -> Self {
        Self::new(TierLimits::default(), MinimumTiers::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tier_below_minimum() {
        let table = LimitTable::default();
        let denial = table
            .check_tier(Tier::Tier0, ComplianceCategory::Withdrawal)
            .unwrap_err();
        assert_eq!(
            denial,
            DenialReason::TierTooLow {
                tier: Tier::Tier0,
                required: Tier::Tier1
            }
        );
    }

    #[test]
    fn test_tier_ceiling() {
        let table = LimitTable::default();
        let ceiling = table
            .check_tier(Tier::Tier3, ComplianceCategory::Exchange)
            .unwrap();
        assert_eq!(ceiling.monthly, dec!(1_000_000_000_000));
    }
}
