//! Compliance gateway
//!
//! Check order: standing, tier, ceiling pre-check, registry approval,
//! enhanced verification for large amounts, then the atomic window charge.
//! Registry calls happen before the charge, so no shard lock is held
//! across an await.

use crate::limits::LimitTable;
use crate::window::{Allocation, WindowBook, WindowUsage, WindowWarning};
use chrono::Duration;
use reserve_core::config::{Ceiling, ComplianceConfig};
use reserve_core::{
    AccountId, Amount, Clock, ComplianceCategory, ComplianceRegistry, DenialReason, Error, Event,
    EventBus, Metrics, Result, RetryPolicy, Standing, Tier,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Allowed; the usage is already charged
    Approved(Allocation),
    /// Refused; nothing charged
    Denied(DenialReason),
}

/// One leg of a multi-account check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    /// Account
    pub account: AccountId,
    /// Category
    pub category: ComplianceCategory,
    /// Amount
    pub amount: Amount,
}

/// Outcome of a multi-account check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    /// Every leg approved and charged
    Approved(Vec<Allocation>),
    /// One leg refused; earlier charges were released
    Denied {
        /// Account refused
        account: AccountId,
        /// Why
        reason: DenialReason,
    },
}

/// Usage report for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Account
    pub account: AccountId,
    /// Tier on record, if the registry answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Per-category windows with their ceilings
    pub categories: Vec<CategoryUsage>,
}

/// Usage and ceilings for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsage {
    /// Window counters
    #[serde(flatten)]
    pub usage: WindowUsage,
    /// Daily ceiling for the tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_ceiling: Option<Amount>,
    /// Monthly ceiling for the tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_ceiling: Option<Amount>,
}

/// Registry answers needed for one check
struct Screening {
    standing: Standing,
    tier: Tier,
}

/// Compliance gateway
pub struct ComplianceGateway {
    registry: Arc<dyn ComplianceRegistry>,
    config: ComplianceConfig,
    limits: LimitTable,
    book: WindowBook,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for ComplianceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceGateway")
            .field("tracked_windows", &self.book.tracked())
            .field("fail_open", &self.config.fail_open_on_registry_outage)
            .finish()
    }
}

impl ComplianceGateway {
    /// Create new gateway
    pub fn new(
        registry: Arc<dyn ComplianceRegistry>,
        config: ComplianceConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let book = WindowBook::new(
            Duration::hours(config.daily_window_hours),
            Duration::days(config.monthly_window_days),
            config.warning_ratio,
        );
        Self {
            registry,
            limits: LimitTable::from_config(&config),
            config,
            book,
            retry,
            clock,
            events,
            metrics: None,
        }
    }

    /// Record denials in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check one (account, category, amount) and charge its windows on approval
    pub async fn check(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        correlation_id: Option<&str>,
    ) -> Result<Decision> {
        if account.is_blank() {
            return Err(Error::Validation("account must not be empty".into()));
        }
        if amount <= Amount::ZERO {
            return Err(Error::Validation(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        let decision = match self.screen(account, category, amount).await {
            Ok(ceiling) => self.charge(account, category, amount, ceiling, correlation_id),
            Err(reason) => Decision::Denied(reason),
        };

        if let Decision::Denied(reason) = &decision {
            info!(
                %account,
                %category,
                %amount,
                reason = reason.label(),
                "Compliance denied"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_denial(reason.label());
            }
        }
        Ok(decision)
    }

    /// Check several legs as a unit; any denial releases the earlier charges
    pub async fn check_all(
        &self,
        requests: &[CheckRequest],
        correlation_id: Option<&str>,
    ) -> Result<BatchDecision> {
        let mut approved: Vec<Allocation> = Vec::with_capacity(requests.len());

        for request in requests {
            let decision = self
                .check(
                    &request.account,
                    request.category,
                    request.amount,
                    correlation_id,
                )
                .await;

            match decision {
                Ok(Decision::Approved(allocation)) => approved.push(allocation),
                Ok(Decision::Denied(reason)) => {
                    self.release_all(&approved);
                    return Ok(BatchDecision::Denied {
                        account: request.account.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    self.release_all(&approved);
                    return Err(e);
                }
            }
        }

        Ok(BatchDecision::Approved(approved))
    }

    /// Hand back a charge for an operation that failed or rolled back
    pub fn release(&self, allocation: &Allocation) {
        let released = self.book.release(allocation, self.clock.now());
        debug!(
            account = %allocation.account,
            category = %allocation.category,
            amount = %allocation.amount,
            released,
            "Released compliance allocation"
        );
    }

    /// Release several charges
    pub fn release_all(&self, allocations: &[Allocation]) {
        for allocation in allocations {
            self.release(allocation);
        }
    }

    /// Current usage and ceilings across all categories for an account
    pub async fn usage(&self, account: &AccountId) -> UsageReport {
        let tier = match self
            .retry
            .execute("registry.get_tier", || self.registry.get_tier(account))
            .await
        {
            Ok(tier) => Some(tier),
            Err(e) => {
                warn!(%account, error = %e, "Tier lookup failed for usage report");
                None
            }
        };

        let now = self.clock.now();
        let categories = [
            ComplianceCategory::Deposit,
            ComplianceCategory::Withdrawal,
            ComplianceCategory::Exchange,
        ]
        .into_iter()
        .map(|category| {
            let ceiling = tier.map(|t| self.limits.ceiling(t, category));
            CategoryUsage {
                usage: self.book.usage(account, category, now),
                daily_ceiling: ceiling.map(|c| c.daily),
                monthly_ceiling: ceiling.map(|c| c.monthly),
            }
        })
        .collect();

        UsageReport {
            account: account.clone(),
            tier,
            categories,
        }
    }

    /// Report a completed operation to the registry audit trail
    pub async fn record_event(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        correlation_id: &str,
    ) -> Result<()> {
        self.retry
            .execute("registry.register_event", || {
                self.registry
                    .register_event(account, category, amount, correlation_id)
            })
            .await
    }

    /// Registry checks; returns the ceiling in force, `Err` carries the denial
    async fn screen(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
    ) -> std::result::Result<Ceiling, DenialReason> {
        let screening = self.lookup(account).await?;

        match screening.standing {
            Standing::Clear => {}
            Standing::SanctionsHold => return Err(DenialReason::SanctionsHold),
            Standing::VerificationExpired => return Err(DenialReason::ExpiredVerification),
        }

        let ceiling = self.limits.check_tier(screening.tier, category)?;
        // spare the registry calls for requests already over the limit
        self.book
            .precheck(account, category, amount, ceiling, self.clock.now())?;

        let approved = match self
            .retry
            .execute("registry.is_approved", || {
                self.registry.is_approved(account, category, amount)
            })
            .await
        {
            Ok(approved) => approved,
            Err(e) => self.on_outage(account, &e).map(|_| true)?,
        };
        if !approved {
            return Err(DenialReason::NotApproved);
        }

        if amount > self.config.large_transaction_threshold {
            // Secondary check never fails open
            let verified = self
                .retry
                .execute("registry.enhanced_verification", || {
                    self.registry.enhanced_verification(account, category, amount)
                })
                .await
                .map_err(|e| DenialReason::RegistryUnavailable {
                    detail: e.to_string(),
                })?;
            if !verified {
                return Err(DenialReason::EnhancedVerificationFailed);
            }
        }

        Ok(ceiling)
    }

    async fn lookup(&self, account: &AccountId) -> std::result::Result<Screening, DenialReason> {
        let standing = match self
            .retry
            .execute("registry.standing", || self.registry.standing(account))
            .await
        {
            Ok(standing) => standing,
            Err(e) => {
                self.on_outage(account, &e)?;
                Standing::Clear
            }
        };

        let tier = match self
            .retry
            .execute("registry.get_tier", || self.registry.get_tier(account))
            .await
        {
            Ok(tier) => tier,
            Err(e) => {
                self.on_outage(account, &e)?;
                self.config.fail_open_tier
            }
        };

        Ok(Screening { standing, tier })
    }

    /// Deny unless the fail-open override is set
    fn on_outage(&self, account: &AccountId, error: &Error) -> std::result::Result<(), DenialReason> {
        if self.config.fail_open_on_registry_outage {
            warn!(%account, error = %error, "Registry unavailable, failing open");
            Ok(())
        } else {
            warn!(%account, error = %error, "Registry unavailable, denying");
            Err(DenialReason::RegistryUnavailable {
                detail: error.to_string(),
            })
        }
    }

    fn charge(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        ceiling: Ceiling,
        correlation_id: Option<&str>,
    ) -> Decision {
        match self
            .book
            .charge(account, category, amount, ceiling, self.clock.now())
        {
            Ok((allocation, warnings)) => {
                self.warn_usage(account, category, &warnings, correlation_id);
                debug!(%account, %category, %amount, "Compliance approved");
                Decision::Approved(allocation)
            }
            Err(reason) => Decision::Denied(reason),
        }
    }

    fn warn_usage(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        warnings: &[WindowWarning],
        correlation_id: Option<&str>,
    ) {
        for warning in warnings {
            warn!(
                %account,
                %category,
                window = warning.window,
                used = %warning.used,
                ceiling = %warning.ceiling,
                "Compliance usage above warning ratio"
            );
            self.events.publish(Event::ComplianceWarning {
                account: account.clone(),
                category,
                window: warning.window.to_string(),
                used: warning.used,
                ceiling: warning.ceiling,
                correlation_id: correlation_id.map(str::to_string),
            });
        }
    }
}
