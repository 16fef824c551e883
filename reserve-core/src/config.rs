//! Configuration for the reserve rail
//!
//! Every section has a `Default` carrying production defaults, so a TOML
//! file only needs the keys it changes.

use crate::types::{ComplianceCategory, Tier};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service identity and runtime
    pub service: ServiceConfig,

    /// Retry/backoff/timeout for every external call
    pub retry: RetryConfig,

    /// Compliance gateway limits and windows
    pub compliance: ComplianceConfig,

    /// Exchange rate resolver
    pub rates: RateConfig,

    /// Reserve reconciliation thresholds and cadence
    pub reconciliation: ReconciliationConfig,

    /// Proof-of-reserves cadence and validity
    pub proof: ProofConfig,

    /// Orchestrator workflow settings
    pub orchestrator: OrchestratorConfig,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Data directory for the persistent operation store
    pub data_dir: PathBuf,

    /// Event bus buffer (events per subscriber before lagging)
    pub event_buffer: usize,

    /// Emit JSON log lines
    pub json_logs: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "reserve-node".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("./data/operations"),
            event_buffer: 1024,
            json_logs: false,
        }
    }
}

/// Retry and timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First backoff delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,

    /// Exponential multiplier
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the delay
    pub jitter_factor: f64,

    /// Bounded timeout per external call (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            call_timeout_ms: 30_000,
        }
    }
}

/// Daily and monthly ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ceiling {
    /// Rolling 24h ceiling
    pub daily: Decimal,
    /// Rolling 30d ceiling
    pub monthly: Decimal,
}

impl Ceiling {
    /// Same ceiling for every category
    pub const fn new(daily: Decimal, monthly: Decimal) -> Self {
        Self { daily, monthly }
    }

    /// A zero ceiling forbids the category outright
    pub fn is_closed(&self) -> bool {
        self.daily.is_zero() || self.monthly.is_zero()
    }
}

/// Ceilings per operation category for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLimits {
    /// Deposit ceilings
    pub deposit: Ceiling,
    /// Withdrawal ceilings
    pub withdrawal: Ceiling,
    /// Exchange ceilings
    pub exchange: Ceiling,
}

impl CategoryLimits {
    /// Same ceiling across categories
    pub fn uniform(ceiling: Ceiling) -> Self {
        Self {
            deposit: ceiling,
            withdrawal: ceiling,
            exchange: ceiling,
        }
    }

    /// Ceiling for a category
    pub fn for_category(&self, category: ComplianceCategory) -> Ceiling {
        match category {
            ComplianceCategory::Deposit => self.deposit,
            ComplianceCategory::Withdrawal => self.withdrawal,
            ComplianceCategory::Exchange => self.exchange,
        }
    }
}

/// Ceilings for all four tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Unverified
    pub tier0: CategoryLimits,
    /// Basic verification
    pub tier1: CategoryLimits,
    /// Enhanced verification
    pub tier2: CategoryLimits,
    /// Institutional
    pub tier3: CategoryLimits,
}

impl TierLimits {
    /// Ceilings for a tier
    pub fn for_tier(&self, tier: Tier) -> &CategoryLimits {
        match tier {
            Tier::Tier0 => &self.tier0,
            Tier::Tier1 => &self.tier1,
            Tier::Tier2 => &self.tier2,
            Tier::Tier3 => &self.tier3,
        }
    }

    /// Ceiling for a tier and category
    pub fn ceiling(&self, tier: Tier, category: ComplianceCategory) -> Ceiling {
        self.for_tier(tier).for_category(category)
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            tier0: CategoryLimits::uniform(Ceiling::new(Decimal::ZERO, Decimal::ZERO)),
            tier1: CategoryLimits::uniform(Ceiling::new(
                Decimal::from(10_000_000u64),  // 0.1 BTC
                Decimal::from(100_000_000u64), // 1 BTC
            )),
            tier2: CategoryLimits::uniform(Ceiling::new(
                Decimal::from(1_000_000_000u64),  // 10 BTC
                Decimal::from(10_000_000_000u64), // 100 BTC
            )),
            tier3: CategoryLimits::uniform(Ceiling::new(
                Decimal::from(100_000_000_000u64),   // 1,000 BTC
                Decimal::from(1_000_000_000_000u64), // 10,000 BTC
            )),
        }
    }
}

/// Minimum tier per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimumTiers {
    /// Deposits
    pub deposit: Tier,
    /// Withdrawals
    pub withdrawal: Tier,
    /// Exchanges
    pub exchange: Tier,
}

impl MinimumTiers {
    /// Minimum tier for a category
    pub fn for_category(&self, category: ComplianceCategory) -> Tier {
        match category {
            ComplianceCategory::Deposit => self.deposit,
            ComplianceCategory::Withdrawal => self.withdrawal,
            ComplianceCategory::Exchange => self.exchange,
        }
    }
}

impl Default for MinimumTiers {
    fn default() -> Self {
        Self {
            deposit: Tier::Tier1,
            withdrawal: Tier::Tier1,
            exchange: Tier::Tier1,
        }
    }
}

/// Compliance gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Ceilings per tier and category
    pub limits: TierLimits,

    /// Minimum tier per category
    pub minimum_tiers: MinimumTiers,

    /// Rolling daily window length (hours)
    pub daily_window_hours: i64,

    /// Rolling monthly window length (days)
    pub monthly_window_days: i64,

    /// Usage fraction that emits a warning event (0.8 = 80%)
    pub warning_ratio: Decimal,

    /// Amounts above this need the secondary registry verification
    pub large_transaction_threshold: Decimal,

    /// Approve when the registry is unreachable (deny-by-default otherwise)
    pub fail_open_on_registry_outage: bool,

    /// Tier assumed while failing open
    pub fail_open_tier: Tier,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            limits: TierLimits::default(),
            minimum_tiers: MinimumTiers::default(),
            daily_window_hours: 24,
            monthly_window_days: 30,
            warning_ratio: Decimal::new(8, 1),
            large_transaction_threshold: Decimal::from(1_000_000_000u64),
            fail_open_on_registry_outage: false,
            fail_open_tier: Tier::Tier1,
        }
    }
}

/// Seed rate used as fallback before any oracle rate is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRate {
    /// Base asset
    pub base: String,
    /// Quote asset
    pub quote: String,
    /// Units of quote per unit of base
    pub rate: Decimal,
}

/// Exchange rate resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Expected oracle update frequency (seconds); staleness is 2x this
    pub update_frequency_secs: u64,

    /// Maximum accepted jump versus the last accepted rate (percent)
    pub max_deviation_pct: Decimal,

    /// Fee when pricing from a fresh oracle rate (basis points)
    pub oracle_fee_bps: u32,

    /// Fee when pricing from the fallback rate (basis points)
    pub fallback_fee_bps: u32,

    /// Quote lifetime (seconds)
    pub quote_ttl_secs: u64,

    /// Notional above which price impact applies
    pub impact_notional: Decimal,

    /// Impact per additional notional multiple (basis points)
    pub impact_bps_per_notional: u32,

    /// Impact cap (basis points)
    pub max_impact_bps: u32,

    /// Slippage tolerance on the quoted output (basis points)
    pub slippage_tolerance_bps: u32,

    /// Decimal places kept on output amounts
    pub amount_scale: u32,

    /// Fallback rates available before the oracle has been accepted once
    pub seed_rates: Vec<SeedRate>,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            update_frequency_secs: 60,
            max_deviation_pct: Decimal::from(5),
            oracle_fee_bps: 30,
            fallback_fee_bps: 100,
            quote_ttl_secs: 30,
            impact_notional: Decimal::from(1_000_000_000u64),
            impact_bps_per_notional: 25,
            max_impact_bps: 300,
            slippage_tolerance_bps: 50,
            amount_scale: 0,
            seed_rates: Vec::new(),
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// At or below: consistent (percent)
    pub tolerance_pct: Decimal,

    /// Minor/Warning severity boundary (percent)
    pub warning_pct: Decimal,

    /// Warning/Critical severity boundary (percent)
    pub critical_pct: Decimal,

    /// Above: emergency halt (percent)
    pub halt_pct: Decimal,

    /// Periodic check interval (seconds)
    pub interval_secs: u64,

    /// Retained results
    pub history_limit: usize,

    /// Run a check after every completed mint/burn workflow
    pub check_after_settlement: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            tolerance_pct: Decimal::ONE,
            warning_pct: Decimal::from(2),
            critical_pct: Decimal::from(3),
            halt_pct: Decimal::from(5),
            interval_secs: 300,
            history_limit: 1000,
            check_after_settlement: true,
        }
    }
}

/// Proof-of-reserves configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofConfig {
    /// Generation cadence (seconds)
    pub cadence_secs: u64,

    /// Validity window from generation (hours)
    pub validity_hours: i64,

    /// Retained proofs
    pub history_limit: usize,

    /// Decimal places of the reserve ratio
    pub ratio_scale: u32,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 86_400,
            validity_hours: 24,
            history_limit: 100,
            ratio_scale: 8,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Custody-backed token minted on deposit and burned on withdrawal
    pub reserve_asset: String,

    /// Account credited with exchange fees
    pub fee_account: String,

    /// Minimum confirmations before a deposit is registered
    pub min_deposit_confirmations: u32,

    /// Maximum workflows executing concurrently
    pub max_in_flight: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reserve_asset: "xBTC".to_string(),
            fee_account: "treasury".to_string(),
            min_deposit_confirmations: 6,
            max_in_flight: 256,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `RESERVE_CONFIG` if set, then apply environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("RESERVE_CONFIG") {
            Ok(path) => Config::from_file(path)?,
            Err(_) => Config::default(),
        };

        if let Ok(dir) = std::env::var("RESERVE_DATA_DIR") {
            config.service.data_dir = PathBuf::from(dir);
        }

        if let Ok(flag) = std::env::var("RESERVE_LOG_JSON") {
            config.service.json_logs = flag == "1" || flag.eq_ignore_ascii_case("true");
        }

        if let Some(ms) = parse_env::<u64>("RESERVE_CALL_TIMEOUT_MS")? {
            config.retry.call_timeout_ms = ms;
        }

        if let Some(secs) = parse_env::<u64>("RESERVE_RECONCILIATION_INTERVAL_SECS")? {
            config.reconciliation.interval_secs = secs;
        }

        if let Some(pct) = parse_env::<Decimal>("RESERVE_HALT_PCT")? {
            config.reconciliation.halt_pct = pct;
        }

        if let Ok(flag) = std::env::var("RESERVE_COMPLIANCE_FAIL_OPEN") {
            config.compliance.fail_open_on_registry_outage =
                flag == "1" || flag.eq_ignore_ascii_case("true");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconciliation;
        if r.tolerance_pct.is_sign_negative() {
            return Err(Error::Config("tolerance_pct must not be negative".into()));
        }
        if !(r.tolerance_pct <= r.warning_pct
            && r.warning_pct <= r.critical_pct
            && r.critical_pct <= r.halt_pct)
        {
            return Err(Error::Config(format!(
                "reconciliation thresholds must be ordered: tolerance {} <= warning {} <= critical {} <= halt {}",
                r.tolerance_pct, r.warning_pct, r.critical_pct, r.halt_pct
            )));
        }
        if r.history_limit == 0 || self.proof.history_limit == 0 {
            return Err(Error::Config("history limits must be positive".into()));
        }
        if self.rates.fallback_fee_bps <= self.rates.oracle_fee_bps {
            return Err(Error::Config(format!(
                "fallback fee ({} bps) must exceed oracle fee ({} bps)",
                self.rates.fallback_fee_bps, self.rates.oracle_fee_bps
            )));
        }
        if self.rates.update_frequency_secs == 0 {
            return Err(Error::Config("update_frequency_secs must be positive".into()));
        }
        if self.compliance.daily_window_hours <= 0 || self.compliance.monthly_window_days <= 0 {
            return Err(Error::Config("compliance windows must be positive".into()));
        }
        if self.compliance.warning_ratio <= Decimal::ZERO
            || self.compliance.warning_ratio > Decimal::ONE
        {
            return Err(Error::Config("warning_ratio must be in (0, 1]".into()));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(Error::Config("call_timeout_ms must be positive".into()));
        }
        if self.orchestrator.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be positive".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
