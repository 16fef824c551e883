//! Oracle validation and fallback pricing

use crate::impact::PriceImpact;
use crate::quote::{FallbackReason, Quote, RateSource};
use crate::BPS_SCALE;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reserve_core::config::RateConfig;
use reserve_core::{
    Amount, AssetId, AssetPair, Clock, Error, OracleRate, PriceOracle, Result, RetryPolicy,
};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rate chosen for one pricing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRate {
    /// Units of quote per unit of base
    pub rate: Decimal,
    /// Provenance
    pub source: RateSource,
}

/// Exchange rate resolver
pub struct RateResolver {
    oracle: Arc<dyn PriceOracle>,
    config: RateConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    impact: PriceImpact,
    accepted: DashMap<String, OracleRate>,
    seeds: HashMap<String, Decimal>,
}

impl std::fmt::Debug for RateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateResolver")
            .field("accepted_pairs", &self.accepted.len())
            .field("seeded_pairs", &self.seeds.len())
            .finish()
    }
}

impl RateResolver {
    /// Create new resolver
    pub fn new(
        oracle: Arc<dyn PriceOracle>,
        config: RateConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let seeds = config
            .seed_rates
            .iter()
            .filter(|seed| seed.rate > Decimal::ZERO)
            .map(|seed| {
                let pair = AssetPair::new(AssetId::new(&seed.base), AssetId::new(&seed.quote));
                (pair.key(), seed.rate)
            })
            .collect();

        Self {
            impact: PriceImpact::from_config(&config),
            oracle,
            config,
            retry,
            clock,
            accepted: DashMap::new(),
            seeds,
        }
    }

    /// Price a swap of `amount` units of `from` into `to`
    pub async fn quote(&self, from: &AssetId, to: &AssetId, amount: Amount) -> Result<Quote> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "exchange amount must be positive, got {}",
                amount
            )));
        }
        if from == to {
            return Err(Error::Validation(format!(
                "cannot exchange {} into itself",
                from
            )));
        }

        let pair = AssetPair::new(from.clone(), to.clone());
        let resolved = self.resolve(&pair).await?;
        let now = self.clock.now();

        let fee_bps = if resolved.source.is_fallback() {
            self.config.fallback_fee_bps
        } else {
            self.config.oracle_fee_bps
        };
        let price_impact_bps = self.impact.bps(amount);
        let effective_rate = PriceImpact::apply(resolved.rate, price_impact_bps);

        let scale = self.config.amount_scale;
        let gross_amount_out = amount
            .checked_mul(effective_rate)
            .ok_or_else(|| {
                Error::Validation(format!("{} {} is too large to exchange into {}", amount, from, to))
            })?
            .round_dp_with_strategy(scale, RoundingStrategy::ToZero);
        let fee_amount = (gross_amount_out * bps(fee_bps))
            .round_dp_with_strategy(scale, RoundingStrategy::AwayFromZero);
        let amount_out = gross_amount_out - fee_amount;
        if amount_out <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "{} {} is too small to exchange into {}",
                amount, from, to
            )));
        }
        let min_amount_out = (amount_out * (Decimal::ONE - bps(self.config.slippage_tolerance_bps)))
            .round_dp_with_strategy(scale, RoundingStrategy::ToZero);

        let quote = Quote {
            id: Uuid::new_v4(),
            pair,
            amount_in: amount,
            rate: resolved.rate,
            effective_rate,
            fee_bps,
            price_impact_bps,
            gross_amount_out,
            fee_amount,
            amount_out,
            min_amount_out,
            source: resolved.source,
            quoted_at: now,
            expires_at: now + Duration::seconds(self.config.quote_ttl_secs as i64),
        };

        debug!(
            pair = %quote.pair,
            rate = %quote.rate,
            fee_bps,
            price_impact_bps,
            amount_out = %quote.amount_out,
            fallback = quote.source.is_fallback(),
            "Quoted exchange"
        );
        Ok(quote)
    }

    /// Fetch, validate and accept the oracle rate, or fall back
    pub async fn resolve(&self, pair: &AssetPair) -> Result<ResolvedRate> {
        let observed = self
            .retry
            .execute("oracle.get_rate", || self.oracle.get_rate(pair))
            .await;

        let reason = match observed {
            Ok(observed) => match self.assess(pair, &observed, self.clock.now()) {
                None => {
                    self.accepted.insert(pair.key(), observed);
                    return Ok(ResolvedRate {
                        rate: observed.rate,
                        source: RateSource::Oracle,
                    });
                }
                Some(reason) => reason,
            },
            Err(e) => FallbackReason::OracleUnavailable {
                detail: e.to_string(),
            },
        };

        self.fallback(pair, reason)
    }

    /// Last oracle rate accepted for a pair
    pub fn last_accepted(&self, pair: &AssetPair) -> Option<OracleRate> {
        self.accepted.get(&pair.key()).map(|r| *r)
    }

    /// Why an observation must not be accepted, if any
    fn assess(
        &self,
        pair: &AssetPair,
        observed: &OracleRate,
        now: DateTime<Utc>,
    ) -> Option<FallbackReason> {
        if observed.rate <= Decimal::ZERO {
            return Some(FallbackReason::InvalidRate);
        }

        let max_age = Duration::seconds(2 * self.config.update_frequency_secs as i64);
        let age = now - observed.as_of;
        if age > max_age {
            return Some(FallbackReason::Stale {
                age_secs: age.num_seconds(),
            });
        }

        if let Some(last) = self.last_accepted(pair) {
            let deviation_pct =
                ((observed.rate - last.rate).abs() / last.rate * Decimal::ONE_HUNDRED).normalize();
            if deviation_pct > self.config.max_deviation_pct {
                return Some(FallbackReason::Deviation { deviation_pct });
            }
        }

        None
    }

    fn fallback(&self, pair: &AssetPair, reason: FallbackReason) -> Result<ResolvedRate> {
        let stored = self
            .last_accepted(pair)
            .map(|r| r.rate)
            .or_else(|| self.seeds.get(&pair.key()).copied())
            .or_else(|| {
                let inverse = AssetPair::new(pair.quote.clone(), pair.base.clone());
                self.seeds
                    .get(&inverse.key())
                    .map(|rate| Decimal::ONE / *rate)
            });

        match stored {
            Some(rate) => {
                warn!(pair = %pair, %rate, reason = %reason, "Using fallback rate");
                Ok(ResolvedRate {
                    rate,
                    source: RateSource::Fallback { reason },
                })
            }
            None => {
                info!(pair = %pair, reason = %reason, "No fallback rate available");
                Err(Error::RateUnavailable {
                    pair: pair.key(),
                    reason: reason.to_string(),
                })
            }
        }
    }
}

fn bps(value: u32) -> Decimal {
    Decimal::from(value) / Decimal::from(BPS_SCALE)
}
