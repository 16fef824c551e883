//! External ledger contracts
//!
//! The orchestrator owns none of these ledgers. Each call returns a typed
//! result or a typed failure; the caller wraps it in a bounded timeout.
//! Mutating calls take a `reference` that the ledger treats as an
//! idempotency key, so a retried call after a lost response is harmless.

use crate::types::{
    AccountId, Amount, AssetId, AssetPair, ComplianceCategory, CustodyTotals, OracleRate,
    ProofData, Standing, Tier,
};
use crate::Result;
use async_trait::async_trait;

/// Compliance registry: tiers, standing and approvals
#[async_trait]
pub trait ComplianceRegistry: Send + Sync {
    /// Tier on record for an account
    async fn get_tier(&self, account: &AccountId) -> Result<Tier>;

    /// Sanctions/verification standing
    async fn standing(&self, account: &AccountId) -> Result<Standing>;

    /// Registry approval for one operation
    async fn is_approved(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
    ) -> Result<bool>;

    /// Stricter secondary verification for large transactions
    async fn enhanced_verification(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
    ) -> Result<bool>;

    /// Record a completed operation for the audit trail
    async fn register_event(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        correlation_id: &str,
    ) -> Result<()>;
}

/// Token ledger for one token asset
#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Asset this ledger issues
    fn asset(&self) -> AssetId;

    /// Current balance
    async fn balance(&self, account: &AccountId) -> Result<Amount>;

    /// Issue tokens
    async fn mint(&self, account: &AccountId, amount: Amount, reference: &str) -> Result<()>;

    /// Destroy tokens
    async fn burn(&self, account: &AccountId, amount: Amount, reference: &str) -> Result<()>;

    /// Outstanding supply
    async fn total_supply(&self) -> Result<Amount>;
}

/// Custody (reserve) ledger
#[async_trait]
pub trait CustodyLedger: Send + Sync {
    /// Confirmations observed for an external transfer
    async fn confirmations(&self, reference: &str) -> Result<u32>;

    /// Register a confirmed external deposit
    async fn register_deposit(&self, reference: &str, amount: Amount, confirmations: u32)
        -> Result<()>;

    /// Undo a deposit registration
    async fn cancel_deposit(&self, reference: &str) -> Result<()>;

    /// Reserve custody funds for a withdrawal; returns the external reference
    async fn process_withdrawal(
        &self,
        withdrawal_id: &str,
        destination: &str,
        amount: Amount,
    ) -> Result<String>;

    /// Undo a processed withdrawal that has not been dispatched
    async fn cancel_withdrawal(&self, withdrawal_id: &str) -> Result<()>;

    /// Release the off-ledger transfer. Irreversible.
    async fn dispatch_withdrawal(&self, withdrawal_id: &str, external_reference: &str)
        -> Result<()>;

    /// Aggregate custody holdings and issued supply
    async fn get_totals(&self) -> Result<CustodyTotals>;

    /// Commission an attested proof of reserves
    async fn generate_proof(&self) -> Result<ProofData>;
}

/// Price feed
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Latest rate for a pair with its observation time
    async fn get_rate(&self, pair: &AssetPair) -> Result<OracleRate>;
}
