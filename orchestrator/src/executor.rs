//! Step execution and compensation
//!
//! Every collaborator call goes through the retry policy, so transient
//! failures are retried with backoff and permanent ones return at once.

use crate::plan::Step;
use crate::record::{Compensation, OperationParams, OperationRecord};
use compliance_gateway::ComplianceGateway;
use rate_resolver::{Quote, RateResolver};
use reserve_core::config::OrchestratorConfig;
use reserve_core::{
    AccountId, AssetId, Clock, CustodyLedger, Error, Metrics, Result, RetryOutcome, RetryPolicy,
    TokenLedger,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a completed step leaves behind
#[derive(Debug, Default)]
pub struct StepEffect {
    /// Attempts made across the step's calls
    pub attempts: u32,
    /// Inverse action, for mutating steps
    pub compensation: Option<Compensation>,
    /// Quote priced by `ResolveRate`
    pub quote: Option<Quote>,
    /// Off-ledger reference produced by custody
    pub external_reference: Option<String>,
    /// Step-specific note
    pub detail: Option<String>,
}

/// Collaborators the workflow steps call
#[derive(Clone)]
pub struct Collaborators {
    /// Custody ledger
    pub custody: Arc<dyn CustodyLedger>,
    /// Token ledgers keyed by asset
    pub ledgers: HashMap<AssetId, Arc<dyn TokenLedger>>,
    /// Compliance gateway
    pub gateway: Arc<ComplianceGateway>,
    /// Exchange rate resolver
    pub resolver: Arc<RateResolver>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("ledgers", &self.ledgers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Collaborators {
    /// Create from a set of token ledgers; each is keyed by its own asset
    pub fn new(
        custody: Arc<dyn CustodyLedger>,
        ledgers: Vec<Arc<dyn TokenLedger>>,
        gateway: Arc<ComplianceGateway>,
        resolver: Arc<RateResolver>,
    ) -> Self {
        Self {
            custody,
            ledgers: ledgers.into_iter().map(|l| (l.asset(), l)).collect(),
            gateway,
            resolver,
        }
    }

    /// Ledger for `asset`
    pub fn ledger(&self, asset: &AssetId) -> Result<&Arc<dyn TokenLedger>> {
        self.ledgers
            .get(asset)
            .ok_or_else(|| Error::Validation(format!("no token ledger for asset {}", asset)))
    }
}

/// Runs workflow steps and their compensations
#[derive(Debug)]
pub struct StepExecutor {
    collaborators: Collaborators,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl StepExecutor {
    /// Create new executor
    pub fn new(
        collaborators: Collaborators,
        config: OrchestratorConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            collaborators,
            config,
            retry,
            clock,
            metrics: None,
        }
    }

    /// Record step retries in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Collaborators in use
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Reserve token minted on deposit and burned on withdrawal
    pub fn reserve_asset(&self) -> AssetId {
        AssetId::new(&self.config.reserve_asset)
    }

    /// Execute one non-compliance step for `record`
    pub async fn execute(&self, step: Step, record: &OperationRecord) -> Result<StepEffect> {
        debug!(operation_id = %record.id, %step, "Executing step");
        match (step, &record.params) {
            (
                Step::ValidateExternal,
                OperationParams::Deposit {
                    external_reference, ..
                },
            ) => self.validate_external(external_reference).await,

            (
                Step::RegisterReserve,
                OperationParams::Deposit {
                    amount,
                    external_reference,
                    confirmations,
                },
            ) => {
                let outcome = self
                    .call("custody.register_deposit", || {
                        self.collaborators.custody.register_deposit(
                            external_reference,
                            *amount,
                            *confirmations,
                        )
                    })
                    .await;
                let attempts = outcome.attempts;
                outcome.result?;
                Ok(StepEffect {
                    attempts,
                    compensation: Some(Compensation::CancelDeposit {
                        reference: external_reference.clone(),
                    }),
                    ..StepEffect::default()
                })
            }

            (Step::Mint, OperationParams::Deposit { amount, .. }) => {
                let asset = self.reserve_asset();
                self.mint(&asset, &record.account, *amount, record).await
            }

            (Step::ValidateBalance, OperationParams::Withdrawal { amount, .. }) => {
                let ledger = self.collaborators.ledger(&self.reserve_asset())?;
                let outcome = self
                    .call("token.balance", || ledger.balance(&record.account))
                    .await;
                let attempts = outcome.attempts;
                let available = outcome.result?;
                if available < *amount {
                    return Err(Error::InsufficientBalance {
                        account: record.account.clone(),
                        required: *amount,
                        available,
                    });
                }
                Ok(StepEffect {
                    attempts,
                    detail: Some(format!("balance {}", available)),
                    ..StepEffect::default()
                })
            }

            (Step::Burn, OperationParams::Withdrawal { amount, .. }) => {
                let asset = self.reserve_asset();
                self.burn(&asset, &record.account, *amount, record).await
            }

            (
                Step::ProcessReserve,
                OperationParams::Withdrawal {
                    amount,
                    destination,
                },
            ) => {
                let withdrawal_id = record.id.to_string();
                let outcome = self
                    .call("custody.process_withdrawal", || {
                        self.collaborators.custody.process_withdrawal(
                            &withdrawal_id,
                            destination,
                            *amount,
                        )
                    })
                    .await;
                let attempts = outcome.attempts;
                let external_reference = outcome.result?;
                Ok(StepEffect {
                    attempts,
                    compensation: Some(Compensation::CancelWithdrawal { withdrawal_id }),
                    external_reference: Some(external_reference),
                    ..StepEffect::default()
                })
            }

            (Step::InitiateExternal, OperationParams::Withdrawal { destination, .. }) => {
                let withdrawal_id = record.id.to_string();
                let external_reference = record.external_reference.clone().ok_or_else(|| {
                    Error::InvalidState(format!(
                        "withdrawal {} has no custody reference",
                        record.id.short()
                    ))
                })?;
                let outcome = self
                    .call("custody.dispatch_withdrawal", || {
                        self.collaborators
                            .custody
                            .dispatch_withdrawal(&withdrawal_id, &external_reference)
                    })
                    .await;
                let attempts = outcome.attempts;
                outcome.result?;
                Ok(StepEffect {
                    attempts,
                    compensation: Some(Compensation::Irreversible {
                        detail: format!(
                            "transfer {} released to {}",
                            external_reference, destination
                        ),
                    }),
                    ..StepEffect::default()
                })
            }

            (
                Step::ResolveRate,
                OperationParams::Exchange {
                    from_asset,
                    to_asset,
                    amount,
                    min_amount_out,
                    ..
                },
            ) => {
                let quote = self
                    .collaborators
                    .resolver
                    .quote(from_asset, to_asset, *amount)
                    .await?;
                if let Some(minimum) = min_amount_out {
                    quote.ensure_min_out(*minimum)?;
                }
                Ok(StepEffect {
                    attempts: 1,
                    detail: Some(format!(
                        "rate {} fee {} bps impact {} bps",
                        quote.effective_rate, quote.fee_bps, quote.price_impact_bps
                    )),
                    quote: Some(quote),
                    ..StepEffect::default()
                })
            }

            (
                Step::DebitSource,
                OperationParams::Exchange {
                    from_asset, amount, ..
                },
            ) => {
                let quote = self.live_quote(record)?;
                let asset = from_asset.clone();
                let mut effect = self.burn(&asset, &record.account, *amount, record).await?;
                effect.detail = Some(format!("quote {}", quote.id));
                Ok(effect)
            }

            (Step::CreditDestination, OperationParams::Exchange { to_asset, .. }) => {
                let quote = Self::quote_of(record)?;
                let destination = record.exchange_destination().clone();
                self.mint(to_asset, &destination, quote.amount_out, record)
                    .await
            }

            (Step::CollectFee, OperationParams::Exchange { to_asset, .. }) => {
                let quote = Self::quote_of(record)?;
                if quote.fee_amount <= Decimal::ZERO {
                    return Ok(StepEffect {
                        attempts: 0,
                        detail: Some("no fee".into()),
                        ..StepEffect::default()
                    });
                }
                let fee_account = AccountId::new(&self.config.fee_account);
                self.mint(to_asset, &fee_account, quote.fee_amount, record)
                    .await
            }

            (Step::Audit, params) => {
                let outcome = self
                    .collaborators
                    .gateway
                    .record_event(
                        &record.account,
                        record.kind.category(),
                        params.amount(),
                        &record.id.to_string(),
                    )
                    .await;
                outcome.map(|_| StepEffect {
                    attempts: 1,
                    ..StepEffect::default()
                })
            }

            (step, params) => Err(Error::InvalidState(format!(
                "step {} does not apply to a {} workflow",
                step,
                params.kind()
            ))),
        }
    }

    /// Apply one compensation
    pub async fn compensate(&self, compensation: &Compensation) -> RetryOutcome<()> {
        match compensation {
            Compensation::CancelDeposit { reference } => {
                self.call("custody.cancel_deposit", || {
                    self.collaborators.custody.cancel_deposit(reference)
                })
                .await
            }
            Compensation::Burn {
                asset,
                account,
                amount,
                reference,
            } => match self.collaborators.ledger(asset) {
                Ok(ledger) => {
                    self.call("token.burn", || ledger.burn(account, *amount, reference))
                        .await
                }
                Err(e) => RetryOutcome {
                    result: Err(e),
                    attempts: 0,
                },
            },
            Compensation::Mint {
                asset,
                account,
                amount,
                reference,
            } => match self.collaborators.ledger(asset) {
                Ok(ledger) => {
                    self.call("token.mint", || ledger.mint(account, *amount, reference))
                        .await
                }
                Err(e) => RetryOutcome {
                    result: Err(e),
                    attempts: 0,
                },
            },
            Compensation::CancelWithdrawal { withdrawal_id } => {
                self.call("custody.cancel_withdrawal", || {
                    self.collaborators.custody.cancel_withdrawal(withdrawal_id)
                })
                .await
            }
            Compensation::Irreversible { detail } => RetryOutcome {
                result: Err(Error::Rejected {
                    collaborator: "custody".into(),
                    reason: format!("cannot be reversed: {}", detail),
                }),
                attempts: 0,
            },
        }
    }

    async fn validate_external(&self, reference: &str) -> Result<StepEffect> {
        let outcome = self
            .call("custody.confirmations", || {
                self.collaborators.custody.confirmations(reference)
            })
            .await;
        let attempts = outcome.attempts;
        let observed = outcome.result?;
        if observed < self.config.min_deposit_confirmations {
            return Err(Error::Rejected {
                collaborator: "custody".into(),
                reason: format!(
                    "transfer {} has {} confirmations, {} required",
                    reference, observed, self.config.min_deposit_confirmations
                ),
            });
        }
        Ok(StepEffect {
            attempts,
            detail: Some(format!("{} confirmations", observed)),
            ..StepEffect::default()
        })
    }

    async fn mint(
        &self,
        asset: &AssetId,
        account: &AccountId,
        amount: Decimal,
        record: &OperationRecord,
    ) -> Result<StepEffect> {
        let ledger = self.collaborators.ledger(asset)?;
        let step = record.next().map(|s| s.as_str()).unwrap_or("mint");
        let reference = record.reference(step);
        let outcome = self
            .call("token.mint", || ledger.mint(account, amount, &reference))
            .await;
        let attempts = outcome.attempts;
        outcome.result?;
        Ok(StepEffect {
            attempts,
            compensation: Some(Compensation::Burn {
                asset: asset.clone(),
                account: account.clone(),
                amount,
                reference: record.reference(&format!("rollback-{}", step)),
            }),
            ..StepEffect::default()
        })
    }

    async fn burn(
        &self,
        asset: &AssetId,
        account: &AccountId,
        amount: Decimal,
        record: &OperationRecord,
    ) -> Result<StepEffect> {
        let ledger = self.collaborators.ledger(asset)?;
        let step = record.next().map(|s| s.as_str()).unwrap_or("burn");
        let reference = record.reference(step);
        let outcome = self
            .call("token.burn", || ledger.burn(account, amount, &reference))
            .await;
        let attempts = outcome.attempts;
        outcome.result?;
        Ok(StepEffect {
            attempts,
            compensation: Some(Compensation::Mint {
                asset: asset.clone(),
                account: account.clone(),
                amount,
                reference: record.reference(&format!("rollback-{}", step)),
            }),
            ..StepEffect::default()
        })
    }

    fn quote_of(record: &OperationRecord) -> Result<&Quote> {
        record.quote.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("exchange {} has no quote", record.id.short()))
        })
    }

    fn live_quote<'a>(&self, record: &'a OperationRecord) -> Result<&'a Quote> {
        let quote = Self::quote_of(record)?;
        if quote.is_expired(self.clock.now()) {
            warn!(
                operation_id = %record.id,
                quote_id = %quote.id,
                expires_at = %quote.expires_at,
                "Quote expired before execution"
            );
            return Err(Error::Rejected {
                collaborator: "rate-resolver".into(),
                reason: format!("quote {} expired at {}", quote.id, quote.expires_at),
            });
        }
        Ok(quote)
    }

    async fn call<F, Fut, T>(&self, operation_name: &str, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let outcome = self.retry.run(operation_name, operation).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_retries(outcome.retries());
        }
        outcome
    }
}
