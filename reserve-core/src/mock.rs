//! In-memory collaborator simulators
//!
//! Used by tests and the demo node. Every simulator carries a [`FaultPlan`]
//! so a method can be made to fail transiently N times, fail permanently,
//! or hang past the call timeout.

use crate::collaborators::{ComplianceRegistry, CustodyLedger, PriceOracle, TokenLedger};
use crate::types::{
    AccountId, Amount, AssetId, AssetPair, ComplianceCategory, CustodyTotals, OracleRate,
    ProofData, Standing, Tier,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Injected failure for one method
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail with `Unavailable` for the next `remaining` calls
    Transient {
        /// Calls left to fail
        remaining: u32,
    },
    /// Fail every call with this error
    Permanent(Error),
    /// Never return
    Hang,
}

/// Per-method failure injection and call log
#[derive(Debug, Default)]
pub struct FaultPlan {
    faults: Mutex<HashMap<&'static str, Fault>>,
    calls: Mutex<Vec<&'static str>>,
}

enum Action {
    Proceed,
    Fail(Error),
    Hang,
}

impl FaultPlan {
    /// Install a fault for `method`
    pub fn inject(&self, method: &'static str, fault: Fault) {
        self.faults.lock().insert(method, fault);
    }

    /// Remove the fault for `method`
    pub fn clear(&self, method: &'static str) {
        self.faults.lock().remove(method);
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// Number of calls to `method`
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| **m == method).count()
    }

    async fn enter(&self, method: &'static str) -> Result<()> {
        self.calls.lock().push(method);

        let action = {
            let mut faults = self.faults.lock();
            match faults.get_mut(method) {
                None => Action::Proceed,
                Some(Fault::Transient { remaining }) => {
                    if *remaining <= 1 {
                        faults.remove(method);
                    } else {
                        *remaining -= 1;
                    }
                    Action::Fail(Error::Unavailable(format!("{} (injected)", method)))
                }
                Some(Fault::Permanent(err)) => Action::Fail(err.clone()),
                Some(Fault::Hang) => Action::Hang,
            }
        };

        match action {
            Action::Proceed => Ok(()),
            Action::Fail(err) => {
                debug!(method, error = %err, "Injected failure");
                Err(err)
            }
            Action::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    tier: Tier,
    standing: Standing,
    approved: bool,
    enhanced_ok: bool,
}

impl Default for RegistryEntry {
    fn default() -> Self {
        Self {
            tier: Tier::Tier0,
            standing: Standing::Clear,
            approved: true,
            enhanced_ok: true,
        }
    }
}

/// Event recorded by the mock registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEvent {
    /// Account
    pub account: AccountId,
    /// Category
    pub category: ComplianceCategory,
    /// Amount
    pub amount: Amount,
    /// Correlation ID
    pub correlation_id: String,
}

/// In-memory compliance registry. Unknown accounts are Tier0 and clear.
#[derive(Debug, Default)]
pub struct MockComplianceRegistry {
    accounts: DashMap<AccountId, RegistryEntry>,
    events: Mutex<Vec<RegisteredEvent>>,
    /// Failure injection
    pub faults: FaultPlan,
}

impl MockComplianceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an account's tier
    pub fn set_tier(&self, account: &AccountId, tier: Tier) {
        self.accounts.entry(account.clone()).or_default().tier = tier;
    }

    /// Set an account's standing
    pub fn set_standing(&self, account: &AccountId, standing: Standing) {
        self.accounts.entry(account.clone()).or_default().standing = standing;
    }

    /// Make `is_approved` answer `approved` for an account
    pub fn set_approved(&self, account: &AccountId, approved: bool) {
        self.accounts.entry(account.clone()).or_default().approved = approved;
    }

    /// Make `enhanced_verification` answer `ok` for an account
    pub fn set_enhanced_verification(&self, account: &AccountId, ok: bool) {
        self.accounts.entry(account.clone()).or_default().enhanced_ok = ok;
    }

    /// Events registered so far
    pub fn events(&self) -> Vec<RegisteredEvent> {
        self.events.lock().clone()
    }

    fn entry(&self, account: &AccountId) -> RegistryEntry {
        self.accounts
            .get(account)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ComplianceRegistry for MockComplianceRegistry {
    async fn get_tier(&self, account: &AccountId) -> Result<Tier> {
        self.faults.enter("get_tier").await?;
        Ok(self.entry(account).tier)
    }

    async fn standing(&self, account: &AccountId) -> Result<Standing> {
        self.faults.enter("standing").await?;
        Ok(self.entry(account).standing)
    }

    async fn is_approved(
        &self,
        account: &AccountId,
        _category: ComplianceCategory,
        _amount: Amount,
    ) -> Result<bool> {
        self.faults.enter("is_approved").await?;
        Ok(self.entry(account).approved)
    }

    async fn enhanced_verification(
        &self,
        account: &AccountId,
        _category: ComplianceCategory,
        _amount: Amount,
    ) -> Result<bool> {
        self.faults.enter("enhanced_verification").await?;
        Ok(self.entry(account).enhanced_ok)
    }

    async fn register_event(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        correlation_id: &str,
    ) -> Result<()> {
        self.faults.enter("register_event").await?;
        let mut events = self.events.lock();
        if !events.iter().any(|e| e.correlation_id == correlation_id) {
            events.push(RegisteredEvent {
                account: account.clone(),
                category,
                amount,
                correlation_id: correlation_id.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TokenState {
    balances: HashMap<AccountId, Amount>,
    supply: Amount,
    applied: HashSet<String>,
}

/// In-memory token ledger for one asset
#[derive(Debug)]
pub struct MockTokenLedger {
    asset: AssetId,
    state: Mutex<TokenState>,
    /// Failure injection
    pub faults: FaultPlan,
}

impl MockTokenLedger {
    /// Create an empty ledger for `asset`
    pub fn new(asset: impl Into<String>) -> Self {
        Self {
            asset: AssetId::new(asset),
            state: Mutex::new(TokenState::default()),
            faults: FaultPlan::default(),
        }
    }

    /// Seed a balance outside any workflow
    pub fn credit(&self, account: &AccountId, amount: Amount) {
        let mut state = self.state.lock();
        *state.balances.entry(account.clone()).or_default() += amount;
        state.supply += amount;
    }

    /// Balance without going through the fault plan
    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.state
            .lock()
            .balances
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    /// Supply without going through the fault plan
    pub fn supply(&self) -> Amount {
        self.state.lock().supply
    }
}

#[async_trait]
impl TokenLedger for MockTokenLedger {
    fn asset(&self) -> AssetId {
        self.asset.clone()
    }

    async fn balance(&self, account: &AccountId) -> Result<Amount> {
        self.faults.enter("balance").await?;
        Ok(self.balance_of(account))
    }

    async fn mint(&self, account: &AccountId, amount: Amount, reference: &str) -> Result<()> {
        self.faults.enter("mint").await?;
        let mut state = self.state.lock();
        if !state.applied.insert(reference.to_string()) {
            return Ok(());
        }
        *state.balances.entry(account.clone()).or_default() += amount;
        state.supply += amount;
        info!(asset = %self.asset, %account, %amount, reference, "Mock mint");
        Ok(())
    }

    async fn burn(&self, account: &AccountId, amount: Amount, reference: &str) -> Result<()> {
        self.faults.enter("burn").await?;
        let mut state = self.state.lock();
        if state.applied.contains(reference) {
            return Ok(());
        }
        let available = state.balances.get(account).copied().unwrap_or_default();
        if available < amount {
            return Err(Error::InsufficientBalance {
                account: account.clone(),
                required: amount,
                available,
            });
        }
        state.applied.insert(reference.to_string());
        *state.balances.entry(account.clone()).or_default() -= amount;
        state.supply -= amount;
        info!(asset = %self.asset, %account, %amount, reference, "Mock burn");
        Ok(())
    }

    async fn total_supply(&self) -> Result<Amount> {
        self.faults.enter("total_supply").await?;
        Ok(self.supply())
    }
}

#[derive(Debug, Clone)]
struct DepositEntry {
    amount: Amount,
    cancelled: bool,
}

#[derive(Debug, Clone)]
struct WithdrawalEntry {
    amount: Amount,
    external_reference: String,
    cancelled: bool,
    dispatched: bool,
}

#[derive(Debug)]
struct CustodyState {
    custody_total: Amount,
    issued_total: Amount,
    default_confirmations: u32,
    confirmations: HashMap<String, u32>,
    deposits: HashMap<String, DepositEntry>,
    withdrawals: HashMap<String, WithdrawalEntry>,
    reported_ratio: Option<Decimal>,
}

/// In-memory custody ledger
///
/// Registered deposits raise both custody holdings and issued supply;
/// processed withdrawals lower both.
#[derive(Debug)]
pub struct MockCustodyLedger {
    state: Mutex<CustodyState>,
    /// Failure injection
    pub faults: FaultPlan,
}

impl Default for MockCustodyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCustodyLedger {
    /// Empty custody; unknown transfers report 6 confirmations
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CustodyState {
                custody_total: Decimal::ZERO,
                issued_total: Decimal::ZERO,
                default_confirmations: 6,
                confirmations: HashMap::new(),
                deposits: HashMap::new(),
                withdrawals: HashMap::new(),
                reported_ratio: None,
            }),
            faults: FaultPlan::default(),
        }
    }

    /// Seed holdings and issued supply
    pub fn with_totals(custody_total: Amount, issued_total: Amount) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.lock();
            state.custody_total = custody_total;
            state.issued_total = issued_total;
        }
        ledger
    }

    /// Report `ratio` in proofs regardless of the attested totals
    pub fn misreport_ratio(&self, ratio: Decimal) {
        self.state.lock().reported_ratio = Some(ratio);
    }

    /// Confirmations reported for one transfer
    pub fn set_confirmations(&self, reference: &str, confirmations: u32) {
        self.state
            .lock()
            .confirmations
            .insert(reference.to_string(), confirmations);
    }

    /// Shift custody holdings without touching issued supply (simulated drift)
    pub fn adjust_custody(&self, delta: Amount) {
        self.state.lock().custody_total += delta;
    }

    /// Totals without going through the fault plan
    pub fn totals(&self) -> CustodyTotals {
        let state = self.state.lock();
        CustodyTotals {
            custody_total: state.custody_total,
            issued_total: state.issued_total,
        }
    }

    /// Whether a deposit is currently registered
    pub fn is_deposit_registered(&self, reference: &str) -> bool {
        self.state
            .lock()
            .deposits
            .get(reference)
            .map(|d| !d.cancelled)
            .unwrap_or(false)
    }

    /// Whether a withdrawal has been dispatched
    pub fn is_withdrawal_dispatched(&self, withdrawal_id: &str) -> bool {
        self.state
            .lock()
            .withdrawals
            .get(withdrawal_id)
            .map(|w| w.dispatched)
            .unwrap_or(false)
    }
}

#[async_trait]
impl CustodyLedger for MockCustodyLedger {
    async fn confirmations(&self, reference: &str) -> Result<u32> {
        self.faults.enter("confirmations").await?;
        let state = self.state.lock();
        Ok(state
            .confirmations
            .get(reference)
            .copied()
            .unwrap_or(state.default_confirmations))
    }

    async fn register_deposit(
        &self,
        reference: &str,
        amount: Amount,
        confirmations: u32,
    ) -> Result<()> {
        self.faults.enter("register_deposit").await?;
        let mut state = self.state.lock();
        if let Some(existing) = state.deposits.get(reference) {
            if !existing.cancelled {
                return Ok(());
            }
        }
        state.deposits.insert(
            reference.to_string(),
            DepositEntry {
                amount,
                cancelled: false,
            },
        );
        state.custody_total += amount;
        state.issued_total += amount;
        info!(reference, %amount, confirmations, "Mock custody registered deposit");
        Ok(())
    }

    async fn cancel_deposit(&self, reference: &str) -> Result<()> {
        self.faults.enter("cancel_deposit").await?;
        let mut state = self.state.lock();
        let amount = match state.deposits.get_mut(reference) {
            Some(entry) if entry.cancelled => return Ok(()),
            Some(entry) => {
                entry.cancelled = true;
                entry.amount
            }
            None => {
                return Err(Error::Rejected {
                    collaborator: "custody".into(),
                    reason: format!("unknown deposit {}", reference),
                })
            }
        };
        state.custody_total -= amount;
        state.issued_total -= amount;
        info!(reference, %amount, "Mock custody cancelled deposit");
        Ok(())
    }

    async fn process_withdrawal(
        &self,
        withdrawal_id: &str,
        destination: &str,
        amount: Amount,
    ) -> Result<String> {
        self.faults.enter("process_withdrawal").await?;
        if destination.trim().is_empty() || destination.starts_with("invalid") {
            return Err(Error::InvalidDestination(destination.to_string()));
        }
        let mut state = self.state.lock();
        if let Some(existing) = state.withdrawals.get(withdrawal_id) {
            if !existing.cancelled {
                return Ok(existing.external_reference.clone());
            }
        }
        if state.custody_total < amount {
            return Err(Error::InsufficientReserves(format!(
                "custody {} < requested {}",
                state.custody_total, amount
            )));
        }
        let external_reference = format!("ext-{}", withdrawal_id);
        state.withdrawals.insert(
            withdrawal_id.to_string(),
            WithdrawalEntry {
                amount,
                external_reference: external_reference.clone(),
                cancelled: false,
                dispatched: false,
            },
        );
        state.custody_total -= amount;
        state.issued_total -= amount;
        info!(withdrawal_id, destination, %amount, "Mock custody processed withdrawal");
        Ok(external_reference)
    }

    async fn cancel_withdrawal(&self, withdrawal_id: &str) -> Result<()> {
        self.faults.enter("cancel_withdrawal").await?;
        let mut state = self.state.lock();
        let amount = match state.withdrawals.get_mut(withdrawal_id) {
            Some(entry) if entry.cancelled => return Ok(()),
            Some(entry) if entry.dispatched => {
                return Err(Error::Rejected {
                    collaborator: "custody".into(),
                    reason: format!("withdrawal {} already dispatched", withdrawal_id),
                })
            }
            Some(entry) => {
                entry.cancelled = true;
                entry.amount
            }
            None => {
                return Err(Error::Rejected {
                    collaborator: "custody".into(),
                    reason: format!("unknown withdrawal {}", withdrawal_id),
                })
            }
        };
        state.custody_total += amount;
        state.issued_total += amount;
        info!(withdrawal_id, %amount, "Mock custody cancelled withdrawal");
        Ok(())
    }

    async fn dispatch_withdrawal(&self, withdrawal_id: &str, external_reference: &str) -> Result<()> {
        self.faults.enter("dispatch_withdrawal").await?;
        let mut state = self.state.lock();
        match state.withdrawals.get_mut(withdrawal_id) {
            Some(entry) if entry.cancelled => Err(Error::Rejected {
                collaborator: "custody".into(),
                reason: format!("withdrawal {} was cancelled", withdrawal_id),
            }),
            Some(entry) => {
                entry.dispatched = true;
                info!(withdrawal_id, external_reference, "Mock custody dispatched withdrawal");
                Ok(())
            }
            None => Err(Error::Rejected {
                collaborator: "custody".into(),
                reason: format!("unknown withdrawal {}", withdrawal_id),
            }),
        }
    }

    async fn get_totals(&self) -> Result<CustodyTotals> {
        self.faults.enter("get_totals").await?;
        Ok(self.totals())
    }

    async fn generate_proof(&self) -> Result<ProofData> {
        self.faults.enter("generate_proof").await?;
        let totals = self.totals();
        let mut proof = ProofData::attest(totals.custody_total, totals.issued_total, Utc::now());
        if let Some(ratio) = self.state.lock().reported_ratio {
            proof.ratio = Some(ratio);
        }
        Ok(proof)
    }
}

/// In-memory price oracle
#[derive(Debug, Default)]
pub struct MockPriceOracle {
    rates: DashMap<String, OracleRate>,
    /// Failure injection
    pub faults: FaultPlan,
}

impl MockPriceOracle {
    /// Create an oracle with no rates
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a rate observed at `as_of`
    pub fn set_rate(&self, pair: &AssetPair, rate: Decimal, as_of: DateTime<Utc>) {
        self.rates.insert(pair.key(), OracleRate { rate, as_of });
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn get_rate(&self, pair: &AssetPair) -> Result<OracleRate> {
        self.faults.enter("get_rate").await?;
        self.rates
            .get(&pair.key())
            .map(|r| *r)
            .ok_or_else(|| Error::Unavailable(format!("no oracle rate for {}", pair)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_transient_fault_clears() {
        let ledger = MockTokenLedger::new("xBTC");
        let alice = AccountId::new("alice");
        ledger
            .faults
            .inject("mint", Fault::Transient { remaining: 2 });

        assert!(ledger.mint(&alice, dec!(5), "r1").await.is_err());
        assert!(ledger.mint(&alice, dec!(5), "r1").await.is_err());
        ledger.mint(&alice, dec!(5), "r1").await.unwrap();
        assert_eq!(ledger.balance_of(&alice), dec!(5));
        assert_eq!(ledger.faults.call_count("mint"), 3);
    }

    #[tokio::test]
    async fn test_mint_reference_is_idempotent() {
        let ledger = MockTokenLedger::new("xBTC");
        let alice = AccountId::new("alice");
        ledger.mint(&alice, dec!(5), "r1").await.unwrap();
        ledger.mint(&alice, dec!(5), "r1").await.unwrap();
        assert_eq!(ledger.supply(), dec!(5));
    }

    #[tokio::test]
    async fn test_burn_insufficient_balance() {
        let ledger = MockTokenLedger::new("xBTC");
        let alice = AccountId::new("alice");
        ledger.credit(&alice, dec!(3));
        let err = ledger.burn(&alice, dec!(4), "b1").await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_custody_deposit_and_cancel() {
        let custody = MockCustodyLedger::new();
        custody.register_deposit("tx1", dec!(100), 6).await.unwrap();
        assert_eq!(custody.totals().custody_total, dec!(100));
        custody.cancel_deposit("tx1").await.unwrap();
        assert_eq!(custody.totals().custody_total, dec!(0));
        assert!(!custody.is_deposit_registered("tx1"));
    }

    #[tokio::test]
    async fn test_dispatched_withdrawal_cannot_cancel() {
        let custody = MockCustodyLedger::with_totals(dec!(100), dec!(100));
        let ext = custody
            .process_withdrawal("w1", "bc1qdest", dec!(40))
            .await
            .unwrap();
        custody.dispatch_withdrawal("w1", &ext).await.unwrap();
        assert!(custody.cancel_withdrawal("w1").await.is_err());
        assert_eq!(custody.totals().custody_total, dec!(60));
    }

    #[tokio::test]
    async fn test_proof_attestation_matches_totals() {
        let custody = MockCustodyLedger::with_totals(dec!(100), dec!(99));
        let proof = custody.generate_proof().await.unwrap();
        assert_eq!(
            proof.attestation,
            ProofData::attestation_for(dec!(100), dec!(99), proof.generated_at)
        );
    }
}
