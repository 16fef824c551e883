//! Core types shared by every component
//!
//! Amounts are exact decimals in the asset's base unit (satoshi-style
//! integer units by default). Percentages are expressed in percent units,
//! so `1` means 1%.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Monetary amount in base units
pub type Amount = Decimal;

/// Account identifier on the token ledger / compliance registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only identifiers are malformed
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token asset symbol (e.g. `xBTC`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    /// Create new asset ID
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered asset pair, priced as "units of `quote` per unit of `base`"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    /// Asset being sold
    pub base: AssetId,
    /// Asset being bought
    pub quote: AssetId,
}

impl AssetPair {
    /// Create a pair
    pub fn new(base: AssetId, quote: AssetId) -> Self {
        Self { base, quote }
    }

    /// Stable map key, `BASE/QUOTE`
    pub fn key(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Random 256-bit operation identifier, rendered as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId([u8; 32]);

impl OperationId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(rand::random::<[u8; 32]>())
    }

    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.short())
    }
}

impl FromStr for OperationId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::Error::Validation(format!("Invalid operation id '{}': {}", s, e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            crate::Error::Validation(format!("Operation id '{}' is not 32 bytes", s))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for OperationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OperationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Workflow kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// External asset in, custody-backed token out
    Deposit,
    /// Token in, external asset out
    Withdrawal,
    /// Token swap between two assets
    Exchange,
}

impl OperationKind {
    /// Lowercase label for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdrawal => "withdrawal",
            OperationKind::Exchange => "exchange",
        }
    }

    /// Compliance category gating this kind of workflow
    pub fn category(&self) -> ComplianceCategory {
        match self {
            OperationKind::Deposit => ComplianceCategory::Deposit,
            OperationKind::Withdrawal => ComplianceCategory::Withdrawal,
            OperationKind::Exchange => ComplianceCategory::Exchange,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation category tracked by compliance windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplianceCategory {
    /// Deposits
    Deposit,
    /// Withdrawals
    Withdrawal,
    /// Exchanges
    Exchange,
}

impl ComplianceCategory {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceCategory::Deposit => "deposit",
            ComplianceCategory::Withdrawal => "withdrawal",
            ComplianceCategory::Exchange => "exchange",
        }
    }
}

impl fmt::Display for ComplianceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compliance tier, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Unverified
    Tier0,
    /// Basic verification
    Tier1,
    /// Enhanced verification
    Tier2,
    /// Institutional
    Tier3,
}

impl Tier {
    /// Numeric level 0-3
    pub fn level(&self) -> u8 {
        match self {
            Tier::Tier0 => 0,
            Tier::Tier1 => 1,
            Tier::Tier2 => 2,
            Tier::Tier3 => 3,
        }
    }

    /// Parse numeric level
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Tier::Tier0),
            1 => Some(Tier::Tier1),
            2 => Some(Tier::Tier2),
            3 => Some(Tier::Tier3),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.level())
    }
}

/// Registry standing of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Standing {
    /// No holds
    Clear,
    /// Sanctions screening hold
    SanctionsHold,
    /// Identity verification lapsed
    VerificationExpired,
}

/// Per-workflow state machine positions
///
/// Deposit: `Pending → ComplianceChecking → ExternalValidating →
/// ReserveRegistering → Minting → LoggingAudit → Completed`
///
/// Withdrawal: `Pending → ComplianceChecking → BalanceValidating → Burning →
/// ReserveProcessing → ExternalInitiating → LoggingAudit → Completed`
///
/// Exchange: `Pending → ComplianceChecking → RateResolving → SourceDebiting →
/// DestinationCrediting → FeeCollecting → LoggingAudit → Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Accepted, not yet started
    Pending,
    /// Consulting the compliance gateway
    ComplianceChecking,
    /// Verifying the external deposit transfer
    ExternalValidating,
    /// Registering the deposit with custody
    ReserveRegistering,
    /// Minting tokens
    Minting,
    /// Checking token balance
    BalanceValidating,
    /// Burning tokens
    Burning,
    /// Custody withdrawal processing
    ReserveProcessing,
    /// Releasing the off-ledger transfer
    ExternalInitiating,
    /// Resolving the exchange rate
    RateResolving,
    /// Debiting the source asset
    SourceDebiting,
    /// Crediting the destination asset
    DestinationCrediting,
    /// Collecting the exchange fee
    FeeCollecting,
    /// Recording the audit event
    LoggingAudit,
    /// Compensations in progress
    RollingBack,
    /// Terminal: success
    Completed,
    /// Terminal: failed before any ledger mutation
    Failed,
    /// Terminal: compensated after a ledger mutation
    RolledBack,
}

impl OperationStatus {
    /// Terminal states never execute further steps
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::RolledBack
        )
    }

    /// Label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::ComplianceChecking => "compliance_checking",
            OperationStatus::ExternalValidating => "external_validating",
            OperationStatus::ReserveRegistering => "reserve_registering",
            OperationStatus::Minting => "minting",
            OperationStatus::BalanceValidating => "balance_validating",
            OperationStatus::Burning => "burning",
            OperationStatus::ReserveProcessing => "reserve_processing",
            OperationStatus::ExternalInitiating => "external_initiating",
            OperationStatus::RateResolving => "rate_resolving",
            OperationStatus::SourceDebiting => "source_debiting",
            OperationStatus::DestinationCrediting => "destination_crediting",
            OperationStatus::FeeCollecting => "fee_collecting",
            OperationStatus::LoggingAudit => "logging_audit",
            OperationStatus::RollingBack => "rolling_back",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one reserve reconciliation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    /// Within tolerance
    Consistent,
    /// Above tolerance, below halt threshold
    MinorDiscrepancy,
    /// Above halt threshold; new operations blocked
    Halted,
}

impl ReconciliationStatus {
    /// Label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Consistent => "consistent",
            ReconciliationStatus::MinorDiscrepancy => "minor_discrepancy",
            ReconciliationStatus::Halted => "halted",
        }
    }
}

/// Discrepancy alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Just above tolerance
    Minor,
    /// Needs attention
    Warning,
    /// Close to halt threshold
    Critical,
    /// Halt threshold breached
    Emergency,
}

/// Totals reported by the custody ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyTotals {
    /// External asset held in custody
    pub custody_total: Amount,
    /// Token supply as recorded by custody
    pub issued_total: Amount,
}

/// Oracle observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleRate {
    /// Units of quote asset per unit of base asset
    pub rate: Decimal,
    /// When the oracle observed this rate
    pub as_of: DateTime<Utc>,
}

/// Proof material returned by the custody ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofData {
    /// Custody holdings at proof time
    pub custody_total: Amount,
    /// Issued supply at proof time
    pub issued_total: Amount,
    /// Collateralisation ratio as reported by custody; absent with nothing issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<Decimal>,
    /// Generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Custody attestation reference (hex SHA-256 over the attested figures)
    pub attestation: String,
}

impl ProofData {
    /// Attestation digest over the attested figures
    ///
    /// Format: `sha256("{custody_total}|{issued_total}|{generated_at_rfc3339}")`
    pub fn attestation_for(
        custody_total: Amount,
        issued_total: Amount,
        generated_at: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(custody_total.normalize().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(issued_total.normalize().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(generated_at.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build proof data with a matching attestation and ratio
    pub fn attest(custody_total: Amount, issued_total: Amount, generated_at: DateTime<Utc>) -> Self {
        let ratio = if issued_total > Decimal::ZERO {
            custody_total.checked_div(issued_total)
        } else {
            None
        };
        Self {
            custody_total,
            issued_total,
            ratio,
            generated_at,
            attestation: Self::attestation_for(custody_total, issued_total, generated_at),
        }
    }
}
