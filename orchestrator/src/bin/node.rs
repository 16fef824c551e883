//! Reserve rail node
//!
//! Wires the orchestrator, compliance gateway, rate resolver, reconciliation
//! engine and proof scheduler against the in-memory collaborator
//! simulators, then runs the periodic loops until Ctrl-C.

use anyhow::Context;
use compliance_gateway::ComplianceGateway;
use orchestrator::{Collaborators, OperationStore, Orchestrator, ReserveService};
use rate_resolver::RateResolver;
use reconciliation::{HaltSwitch, ProofScheduler, ReconciliationEngine};
use reserve_core::mock::{
    MockComplianceRegistry, MockCustodyLedger, MockPriceOracle, MockTokenLedger,
};
use reserve_core::{
    AssetId, AssetPair, Clock, Config, EventBus, Metrics, RetryPolicy, SystemClock, TokenLedger,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "rocksdb")]
fn open_store(config: &Config) -> anyhow::Result<Arc<dyn OperationStore>> {
    let store = orchestrator::RocksDbStore::open(&config.service.data_dir)
        .with_context(|| format!("opening operation store at {:?}", config.service.data_dir))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(_config: &Config) -> anyhow::Result<Arc<dyn OperationStore>> {
    Ok(Arc::new(orchestrator::InMemoryStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(config.service.json_logs);

    tracing::info!(
        service = %config.service.service_name,
        version = %config.service.service_version,
        "Starting reserve node"
    );

    let clock: Arc<dyn Clock> = SystemClock::shared();
    let events = EventBus::new(config.service.event_buffer);
    let metrics = Metrics::new().context("registering metrics")?;
    let retry = RetryPolicy::new(config.retry.clone());

    // In-memory collaborators
    let registry = Arc::new(MockComplianceRegistry::new());
    let custody = Arc::new(MockCustodyLedger::new());
    let oracle = Arc::new(MockPriceOracle::new());
    let mut ledgers: Vec<Arc<dyn TokenLedger>> = vec![Arc::new(MockTokenLedger::new(
        &config.orchestrator.reserve_asset,
    ))];
    for seed in &config.rates.seed_rates {
        for symbol in [&seed.base, &seed.quote] {
            if !ledgers.iter().any(|l| l.asset().as_str() == symbol.as_str()) {
                ledgers.push(Arc::new(MockTokenLedger::new(symbol)));
            }
        }
        oracle.set_rate(
            &AssetPair::new(AssetId::new(&seed.base), AssetId::new(&seed.quote)),
            seed.rate,
            clock.now(),
        );
    }

    let halt = Arc::new(HaltSwitch::new(events.clone()).with_metrics(metrics.clone()));
    let gateway = Arc::new(
        ComplianceGateway::new(
            registry,
            config.compliance.clone(),
            retry.clone(),
            clock.clone(),
            events.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    let resolver = Arc::new(RateResolver::new(
        oracle,
        config.rates.clone(),
        retry.clone(),
        clock.clone(),
    ));
    let engine = Arc::new(
        ReconciliationEngine::new(
            custody.clone(),
            config.reconciliation.clone(),
            halt.clone(),
            retry.clone(),
            clock.clone(),
            events.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    let proofs = Arc::new(
        ProofScheduler::new(
            custody.clone(),
            config.proof.clone(),
            retry.clone(),
            clock.clone(),
            events.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    let store = open_store(&config)?;
    let orchestrator = Arc::new(
        Orchestrator::new(
            Collaborators::new(custody, ledgers, gateway, resolver),
            store,
            halt,
            &config,
            clock.clone(),
            events.clone(),
        )
        .with_reconciliation(engine.clone())
        .with_metrics(metrics.clone()),
    );

    let resumed = orchestrator.recover().await.context("recovering operations")?;
    tracing::info!(resumed, "Operation store recovered");

    let service = ReserveService::new(
        orchestrator.clone(),
        engine.clone(),
        proofs.clone(),
        clock.clone(),
    );
    tracing::debug!(?service, "Service ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciliation_loop = engine.clone().spawn_periodic(shutdown_rx.clone());
    let proof_loop = proofs.clone().spawn_periodic(shutdown_rx.clone());
    let event_log = tokio::spawn(log_events(events.subscribe(), shutdown_rx));

    tracing::info!("Reserve node running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down reserve node");
    shutdown_tx.send(true).ok();
    let _ = tokio::join!(reconciliation_loop, proof_loop, event_log);

    tracing::info!(
        in_flight = orchestrator.in_flight(),
        metrics = %metrics.gather_text(),
        "Reserve node stopped"
    );
    Ok(())
}

async fn log_events(
    mut events: broadcast::Receiver<reserve_core::Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => tracing::debug!(event = event.name(), payload = ?event, "Event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
