//! Shared harness for orchestrator integration tests

#![allow(dead_code)]

use compliance_gateway::ComplianceGateway;
use orchestrator::{
    Collaborators, InMemoryStore, OperationParams, OperationRecord, OperationRequest,
    OperationStore, Orchestrator, ReserveService,
};
use rate_resolver::RateResolver;
use reconciliation::{HaltSwitch, ProofScheduler, ReconciliationEngine};
use reserve_core::config::{RetryConfig, SeedRate};
use reserve_core::mock::{
    MockComplianceRegistry, MockCustodyLedger, MockPriceOracle, MockTokenLedger,
};
use reserve_core::{
    AccountId, Amount, AssetId, Config, EventBus, ManualClock, Metrics, OperationId,
    OperationStatus, RetryPolicy, Tier, TokenLedger,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

/// Fast retries so failure scenarios finish in milliseconds
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_retries: 1,
        initial_delay_ms: 1,
        jitter_factor: 0.0,
        call_timeout_ms: 100,
        ..RetryConfig::default()
    };
    config.rates.seed_rates = vec![SeedRate {
        base: "xBTC".into(),
        quote: "xETH".into(),
        rate: dec!(15),
    }];
    config
}

/// Collaborators shared by every orchestrator built in a test
pub struct Rig {
    pub config: Config,
    pub registry: Arc<MockComplianceRegistry>,
    pub custody: Arc<MockCustodyLedger>,
    pub oracle: Arc<MockPriceOracle>,
    pub btc: Arc<MockTokenLedger>,
    pub eth: Arc<MockTokenLedger>,
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
    pub metrics: Metrics,
    pub halt: Arc<HaltSwitch>,
    pub gateway: Arc<ComplianceGateway>,
    pub resolver: Arc<RateResolver>,
    pub engine: Arc<ReconciliationEngine>,
    pub proofs: Arc<ProofScheduler>,
    pub store: Arc<InMemoryStore>,
}

impl Rig {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(MockComplianceRegistry::new());
        let custody = Arc::new(MockCustodyLedger::new());
        let oracle = Arc::new(MockPriceOracle::new());
        let clock = Arc::new(ManualClock::starting_now());
        let events = EventBus::new(256);
        let retry = RetryPolicy::new(config.retry.clone());

        let halt = Arc::new(HaltSwitch::new(events.clone()));
        let gateway = Arc::new(ComplianceGateway::new(
            registry.clone(),
            config.compliance.clone(),
            retry.clone(),
            clock.clone(),
            events.clone(),
        ));
        let resolver = Arc::new(RateResolver::new(
            oracle.clone(),
            config.rates.clone(),
            retry.clone(),
            clock.clone(),
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            custody.clone(),
            config.reconciliation.clone(),
            halt.clone(),
            retry.clone(),
            clock.clone(),
            events.clone(),
        ));
        let proofs = Arc::new(ProofScheduler::new(
            custody.clone(),
            config.proof.clone(),
            retry,
            clock.clone(),
            events.clone(),
        ));

        Self {
            config,
            registry,
            custody,
            oracle,
            btc: Arc::new(MockTokenLedger::new("xBTC")),
            eth: Arc::new(MockTokenLedger::new("xETH")),
            clock,
            events,
            metrics: Metrics::new().unwrap(),
            halt,
            gateway,
            resolver,
            engine,
            proofs,
            store: Arc::new(InMemoryStore::new()),
        }
    }

    /// A fresh orchestrator over the shared store, as after a restart
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator_with_store(self.store.clone())
    }

    /// A fresh orchestrator writing to `store`
    pub fn orchestrator_with_store(&self, store: Arc<dyn OperationStore>) -> Arc<Orchestrator> {
        let ledgers: Vec<Arc<dyn TokenLedger>> = vec![self.btc.clone(), self.eth.clone()];
        Arc::new(
            Orchestrator::new(
                Collaborators::new(
                    self.custody.clone(),
                    ledgers,
                    self.gateway.clone(),
                    self.resolver.clone(),
                ),
                store,
                self.halt.clone(),
                &self.config,
                self.clock.clone(),
                self.events.clone(),
            )
            .with_reconciliation(self.engine.clone())
            .with_metrics(self.metrics.clone()),
        )
    }

    /// Verified account at `tier`
    pub fn account(&self, name: &str, tier: Tier) -> AccountId {
        let account = AccountId::new(name);
        self.registry.set_tier(&account, tier);
        account
    }

    pub fn stored(&self) -> usize {
        self.store.count().unwrap()
    }
}

pub struct Harness {
    pub rig: Rig,
    pub orchestrator: Arc<Orchestrator>,
}

impl std::ops::Deref for Harness {
    type Target = Rig;

    fn deref(&self) -> &Rig {
        &self.rig
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let rig = Rig::new(config);
        let orchestrator = rig.orchestrator();
        Self { rig, orchestrator }
    }

    pub fn service(&self) -> ReserveService {
        ReserveService::new(
            self.orchestrator.clone(),
            self.engine.clone(),
            self.proofs.clone(),
            self.clock.clone(),
        )
    }

    pub async fn submit(&self, request: OperationRequest) -> reserve_core::Result<OperationId> {
        self.orchestrator.submit(request).await
    }

    pub async fn wait(&self, id: &OperationId) -> OperationRecord {
        self.orchestrator.wait_for_completion(id, WAIT).await.unwrap()
    }

    /// Submit and wait for a terminal state
    pub async fn run(&self, request: OperationRequest) -> OperationRecord {
        let id = self.submit(request).await.unwrap();
        self.wait(&id).await
    }

    /// Fund `account` through a completed deposit
    pub async fn fund(&self, account: &AccountId, amount: Amount, reference: &str) {
        let record = self.run(deposit(account, amount, reference)).await;
        assert_eq!(
            record.status,
            OperationStatus::Completed,
            "funding deposit did not complete: {:?}",
            record.failure_reason
        );
    }
}

pub fn deposit(account: &AccountId, amount: Amount, reference: &str) -> OperationRequest {
    OperationRequest::new(
        account.clone(),
        OperationParams::Deposit {
            amount,
            external_reference: reference.to_string(),
            confirmations: 6,
        },
    )
}

pub fn withdrawal(account: &AccountId, amount: Amount, destination: &str) -> OperationRequest {
    OperationRequest::new(
        account.clone(),
        OperationParams::Withdrawal {
            amount,
            destination: destination.to_string(),
        },
    )
}

pub fn exchange(account: &AccountId, amount: Amount) -> OperationRequest {
    OperationRequest::new(
        account.clone(),
        OperationParams::Exchange {
            from_asset: AssetId::new("xBTC"),
            to_asset: AssetId::new("xETH"),
            amount,
            destination: None,
            min_amount_out: None,
        },
    )
}
