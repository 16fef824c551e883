//! Proof-of-reserves scheduler
//!
//! Commissions an attested proof from custody, verifies it and keeps a
//! bounded history. A record read past its validity window reports
//! `Expired` whatever its stored status.

use crate::history::BoundedHistory;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reserve_core::config::ProofConfig;
use reserve_core::{
    Amount, Clock, CustodyLedger, Event, EventBus, Metrics, ProofData, Result, RetryPolicy,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Verification status of a proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofStatus {
    /// Not yet verified
    Pending,
    /// Internally consistent and within validity
    Verified,
    /// Inconsistent
    Failed,
    /// Past its validity window
    Expired,
}

/// Stored proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveProofRecord {
    /// Proof ID
    pub id: Uuid,
    /// Custody holdings at proof time
    pub custody_total: Amount,
    /// Issued supply at proof time
    pub issued_total: Amount,
    /// custody / issued; absent when nothing is issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<Decimal>,
    /// Custody attestation digest
    pub attestation: String,
    /// Generation time
    pub generated_at: DateTime<Utc>,
    /// End of validity
    pub valid_until: DateTime<Utc>,
    /// Status at verification time
    pub status: ProofStatus,
    /// Failed checks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl ReserveProofRecord {
    /// Status as observed at `now`
    pub fn status_at(&self, now: DateTime<Utc>) -> ProofStatus {
        if now >= self.valid_until {
            ProofStatus::Expired
        } else {
            self.status
        }
    }

    /// Custody covers issued supply
    pub fn fully_backed(&self) -> bool {
        self.custody_total >= self.issued_total
    }
}

/// Result of verifying a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Resulting status
    pub status: ProofStatus,
    /// Ratio matches the attested totals
    pub ratio_consistent: bool,
    /// Attestation matches the attested totals
    pub attestation_valid: bool,
    /// Not past the validity window
    pub within_validity: bool,
    /// Failed checks
    pub failures: Vec<String>,
}

/// Proof-of-reserves scheduler
pub struct ProofScheduler {
    custody: Arc<dyn CustodyLedger>,
    config: ProofConfig,
    history: Mutex<BoundedHistory<ReserveProofRecord>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for ProofScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofScheduler")
            .field("config", &self.config)
            .field("history_len", &self.history.lock().len())
            .finish()
    }
}

impl ProofScheduler {
    /// Create new scheduler
    pub fn new(
        custody: Arc<dyn CustodyLedger>,
        config: ProofConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            custody,
            history: Mutex::new(BoundedHistory::new(config.history_limit)),
            config,
            retry,
            clock,
            events,
            metrics: None,
        }
    }

    /// Record proofs in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Commission, verify and store a proof
    pub async fn generate(&self) -> Result<ReserveProofRecord> {
        let data = self
            .retry
            .execute("custody.generate_proof", || self.custody.generate_proof())
            .await?;

        let mut record = self.record_from(&data);
        let outcome = self.verify(&record);
        record.status = outcome.status;
        record.failures = outcome.failures;

        match record.status {
            ProofStatus::Verified => info!(
                proof_id = %record.id,
                ratio = ?record.ratio,
                fully_backed = record.fully_backed(),
                "Proof of reserves verified"
            ),
            _ => warn!(
                proof_id = %record.id,
                status = ?record.status,
                failures = ?record.failures,
                "Proof of reserves did not verify"
            ),
        }

        self.history.lock().push(record.clone());

        let verified = record.status == ProofStatus::Verified;
        if let Some(metrics) = &self.metrics {
            metrics.record_proof(verified);
        }
        self.events.publish(Event::ProofGenerated {
            proof_id: record.id,
            ratio: record.ratio,
            verified,
            at: record.generated_at,
        });

        Ok(record)
    }

    /// Check internal consistency and validity of a record
    pub fn verify(&self, record: &ReserveProofRecord) -> VerificationOutcome {
        let mut failures = Vec::new();

        let expected_ratio = self.ratio(record.custody_total, record.issued_total);
        let ratio_consistent = expected_ratio == record.ratio;
        if !ratio_consistent {
            failures.push(format!(
                "ratio {:?} does not match attested totals ({:?})",
                record.ratio, expected_ratio
            ));
        }

        let expected_attestation = ProofData::attestation_for(
            record.custody_total,
            record.issued_total,
            record.generated_at,
        );
        let attestation_valid = expected_attestation == record.attestation;
        if !attestation_valid {
            failures.push("attestation does not match attested totals".to_string());
        }

        let within_validity = self.clock.now() < record.valid_until;

        let status = if !within_validity {
            ProofStatus::Expired
        } else if failures.is_empty() {
            ProofStatus::Verified
        } else {
            ProofStatus::Failed
        };

        VerificationOutcome {
            status,
            ratio_consistent,
            attestation_valid,
            within_validity,
            failures,
        }
    }

    /// Up to `limit` proofs, newest first, with status as of now
    pub fn history(&self, limit: usize) -> Vec<ReserveProofRecord> {
        let now = self.clock.now();
        self.history
            .lock()
            .recent(limit)
            .into_iter()
            .map(|mut record| {
                record.status = record.status_at(now);
                record
            })
            .collect()
    }

    /// Newest proof, with status as of now
    pub fn latest(&self) -> Option<ReserveProofRecord> {
        self.history(1).into_iter().next()
    }

    /// Generate every `cadence_secs` until `shutdown` flips to true
    pub fn spawn_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.cadence_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(cadence_secs = period.as_secs(), "Proof scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.generate().await {
                            error!(error = %e, "Scheduled proof generation failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Proof scheduler stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn record_from(&self, data: &ProofData) -> ReserveProofRecord {
        ReserveProofRecord {
            id: Uuid::new_v4(),
            custody_total: data.custody_total,
            issued_total: data.issued_total,
            ratio: data.ratio.map(|ratio| {
                ratio.round_dp_with_strategy(self.config.ratio_scale, RoundingStrategy::MidpointNearestEven)
            }),
            attestation: data.attestation.clone(),
            generated_at: data.generated_at,
            valid_until: data.generated_at + Duration::hours(self.config.validity_hours),
            status: ProofStatus::Pending,
            failures: Vec::new(),
        }
    }

    fn ratio(&self, custody_total: Amount, issued_total: Amount) -> Option<Decimal> {
        if issued_total <= Decimal::ZERO {
            return None;
        }
        Some(
            (custody_total / issued_total)
                .round_dp_with_strategy(self.config.ratio_scale, RoundingStrategy::MidpointNearestEven),
        )
    }
}
