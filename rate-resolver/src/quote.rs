//! Swap quotes

use chrono::{DateTime, Utc};
use reserve_core::{Amount, AssetPair, Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why the oracle rate was not used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// Observation older than twice the update frequency
    Stale {
        /// Age of the observation (seconds)
        age_secs: i64,
    },
    /// Jump versus the last accepted rate above the configured maximum
    Deviation {
        /// Deviation in percent
        deviation_pct: Decimal,
    },
    /// Zero or negative rate
    InvalidRate,
    /// Oracle call failed
    OracleUnavailable {
        /// Underlying failure
        detail: String,
    },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Stale { age_secs } => write!(f, "stale oracle rate ({}s old)", age_secs),
            FallbackReason::Deviation { deviation_pct } => {
                write!(f, "oracle rate deviates {}% from last accepted", deviation_pct)
            }
            FallbackReason::InvalidRate => write!(f, "invalid oracle rate"),
            FallbackReason::OracleUnavailable { detail } => {
                write!(f, "oracle unavailable: {}", detail)
            }
        }
    }
}

/// Where the quoted rate came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RateSource {
    /// Fresh oracle rate
    Oracle,
    /// Stored rate at the fallback fee
    Fallback {
        /// Why the oracle was bypassed
        reason: FallbackReason,
    },
}

impl RateSource {
    /// Fallback pricing in effect
    pub fn is_fallback(&self) -> bool {
        matches!(self, RateSource::Fallback { .. })
    }
}

/// Priced swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Quote ID
    pub id: Uuid,
    /// Sold/bought assets
    pub pair: AssetPair,
    /// Amount of the base asset sold
    pub amount_in: Amount,
    /// Rate before price impact
    pub rate: Decimal,
    /// Rate after price impact
    pub effective_rate: Decimal,
    /// Fee (basis points)
    pub fee_bps: u32,
    /// Price impact (basis points)
    pub price_impact_bps: u32,
    /// Output before fee
    pub gross_amount_out: Amount,
    /// Fee taken from the output
    pub fee_amount: Amount,
    /// Output credited to the destination
    pub amount_out: Amount,
    /// Slippage bound on the executed output
    pub min_amount_out: Amount,
    /// Rate provenance
    #[serde(flatten)]
    pub source: RateSource,
    /// When priced
    pub quoted_at: DateTime<Utc>,
    /// When the quote stops being executable
    pub expires_at: DateTime<Utc>,
}

impl Quote {
    /// Quote can no longer be executed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Reject when the output is below the caller's minimum
    pub fn ensure_min_out(&self, minimum: Amount) -> Result<()> {
        if self.amount_out < minimum {
            return Err(Error::SlippageExceeded {
                minimum,
                quoted: self.amount_out,
            });
        }
        Ok(())
    }

    /// Executed output is within the slippage bound
    pub fn within_slippage(&self, executed_out: Amount) -> bool {
        executed_out >= self.min_amount_out
    }
}
