//! Rolling usage windows with atomic check-and-increment

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reserve_core::config::Ceiling;
use reserve_core::{AccountId, Amount, ComplianceCategory, DenialReason};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One rolling counter
///
/// The window opens on first use and lasts `length`; it is reset lazily on
/// the next access after it has elapsed. `generation` changes on every reset
/// so a release can tell whether its charge still belongs to this window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingCounter {
    /// Amount charged in the current window
    pub used: Amount,
    /// First use in the current window
    pub started_at: Option<DateTime<Utc>>,
    /// Reset count
    pub generation: u64,
}

impl RollingCounter {
    fn roll(&mut self, now: DateTime<Utc>, length: Duration) {
        if let Some(start) = self.started_at {
            if now >= start + length {
                self.used = Decimal::ZERO;
                self.started_at = None;
                self.generation += 1;
            }
        }
    }

    fn charge(&mut self, amount: Amount, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.used += amount;
    }

    fn refund(&mut self, amount: Amount, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.used = (self.used - amount).max(Decimal::ZERO);
        true
    }

    /// End of the current window, if open
    pub fn resets_at(&self, length: Duration) -> Option<DateTime<Utc>> {
        self.started_at.map(|start| start + length)
    }
}

/// Daily and monthly counters for one (account, category)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceWindow {
    /// Rolling 24h counter
    pub daily: RollingCounter,
    /// Rolling 30d counter
    pub monthly: RollingCounter,
}

impl ComplianceWindow {
    fn admits(&self, amount: Amount, ceiling: Ceiling) -> std::result::Result<(), DenialReason> {
        // an overflowing sum is past any ceiling
        let within = |used: Amount, limit: Amount| {
            used.checked_add(amount)
                .map(|total| total <= limit)
                .unwrap_or(false)
        };

        if !within(self.daily.used, ceiling.daily) {
            return Err(DenialReason::DailyLimitExceeded {
                ceiling: ceiling.daily,
                used: self.daily.used,
                requested: amount,
            });
        }
        if !within(self.monthly.used, ceiling.monthly) {
            return Err(DenialReason::MonthlyLimitExceeded {
                ceiling: ceiling.monthly,
                used: self.monthly.used,
                requested: amount,
            });
        }
        Ok(())
    }
}

/// Usage charged by an approved check; handed back on failure or rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Account charged
    pub account: AccountId,
    /// Category charged
    pub category: ComplianceCategory,
    /// Amount charged
    pub amount: Amount,
    /// Daily window generation at charge time
    pub daily_generation: u64,
    /// Monthly window generation at charge time
    pub monthly_generation: u64,
}

/// A ceiling crossed past the warning ratio by a charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowWarning {
    /// "daily" or "monthly"
    pub window: &'static str,
    /// Usage after the charge
    pub used: Amount,
    /// Ceiling
    pub ceiling: Amount,
}

/// Point-in-time view of one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    /// Category
    pub category: ComplianceCategory,
    /// Used in the rolling 24h window
    pub daily_used: Amount,
    /// Used in the rolling 30d window
    pub monthly_used: Amount,
    /// When the daily window resets, if open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_resets_at: Option<DateTime<Utc>>,
    /// When the monthly window resets, if open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_resets_at: Option<DateTime<Utc>>,
}

/// All compliance windows, keyed by (account, category)
#[derive(Debug)]
pub struct WindowBook {
    windows: DashMap<(AccountId, ComplianceCategory), ComplianceWindow>,
    daily_length: Duration,
    monthly_length: Duration,
    warning_ratio: Decimal,
}

impl WindowBook {
    /// Create a book with the given window lengths
    pub fn new(daily_length: Duration, monthly_length: Duration, warning_ratio: Decimal) -> Self {
        Self {
            windows: DashMap::new(),
            daily_length,
            monthly_length,
            warning_ratio,
        }
    }

    /// Check `used + amount <= ceiling` on both windows and charge on success
    ///
    /// Runs entirely under the map's shard lock for this key, with no await
    /// points, so two concurrent charges cannot both pass a stale check.
    pub fn charge(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        ceiling: Ceiling,
        now: DateTime<Utc>,
    ) -> std::result::Result<(Allocation, Vec<WindowWarning>), DenialReason> {
        let mut entry = self
            .windows
            .entry((account.clone(), category))
            .or_default();
        let window = entry.value_mut();

        window.daily.roll(now, self.daily_length);
        window.monthly.roll(now, self.monthly_length);
        window.admits(amount, ceiling)?;

        let daily_before = window.daily.used;
        let monthly_before = window.monthly.used;
        window.daily.charge(amount, now);
        window.monthly.charge(amount, now);

        let mut warnings = Vec::new();
        if crosses(daily_before, window.daily.used, ceiling.daily, self.warning_ratio) {
            warnings.push(WindowWarning {
                window: "daily",
                used: window.daily.used,
                ceiling: ceiling.daily,
            });
        }
        if crosses(
            monthly_before,
            window.monthly.used,
            ceiling.monthly,
            self.warning_ratio,
        ) {
            warnings.push(WindowWarning {
                window: "monthly",
                used: window.monthly.used,
                ceiling: ceiling.monthly,
            });
        }

        let allocation = Allocation {
            account: account.clone(),
            category,
            amount,
            daily_generation: window.daily.generation,
            monthly_generation: window.monthly.generation,
        };
        Ok((allocation, warnings))
    }

    /// Whether `amount` would fit under `ceiling` right now, without charging
    ///
    /// Advisory only: a concurrent charge can still take the room before
    /// [`WindowBook::charge`] runs.
    pub fn precheck(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        amount: Amount,
        ceiling: Ceiling,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), DenialReason> {
        let mut snapshot = match self.windows.get(&(account.clone(), category)) {
            Some(entry) => entry.value().clone(),
            None => return ComplianceWindow::default().admits(amount, ceiling),
        };
        snapshot.daily.roll(now, self.daily_length);
        snapshot.monthly.roll(now, self.monthly_length);
        snapshot.admits(amount, ceiling)
    }

    /// Hand back a charge. Windows that reset since the charge are untouched.
    pub fn release(&self, allocation: &Allocation, now: DateTime<Utc>) -> bool {
        let key = (allocation.account.clone(), allocation.category);
        match self.windows.get_mut(&key) {
            Some(mut entry) => {
                let window = entry.value_mut();
                window.daily.roll(now, self.daily_length);
                window.monthly.roll(now, self.monthly_length);
                let daily = window
                    .daily
                    .refund(allocation.amount, allocation.daily_generation);
                let monthly = window
                    .monthly
                    .refund(allocation.amount, allocation.monthly_generation);
                daily || monthly
            }
            None => false,
        }
    }

    /// Current usage for one (account, category), rolling expired windows
    pub fn usage(
        &self,
        account: &AccountId,
        category: ComplianceCategory,
        now: DateTime<Utc>,
    ) -> WindowUsage {
        let key = (account.clone(), category);
        let snapshot = match self.windows.get_mut(&key) {
            Some(mut entry) => {
                let window = entry.value_mut();
                window.daily.roll(now, self.daily_length);
                window.monthly.roll(now, self.monthly_length);
                window.clone()
            }
            None => ComplianceWindow::default(),
        };

        WindowUsage {
            category,
            daily_used: snapshot.daily.used,
            monthly_used: snapshot.monthly.used,
            daily_resets_at: snapshot.daily.resets_at(self.daily_length),
            monthly_resets_at: snapshot.monthly.resets_at(self.monthly_length),
        }
    }

    /// Number of tracked (account, category) pairs
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

fn crosses(before: Amount, after: Amount, ceiling: Amount, ratio: Decimal) -> bool {
    if ceiling.is_zero() {
        return false;
    }
    let mark = ceiling * ratio;
    before < mark && after >= mark
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> WindowBook {
        WindowBook::new(Duration::hours(24), Duration::days(30), dec!(0.8))
    }

    fn ceiling() -> Ceiling {
        Ceiling::new(dec!(1000), dec!(5000))
    }

    #[test]
    fn test_charge_within_ceiling() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();

        let (alloc, warnings) = book
            .charge(&alice, ComplianceCategory::Deposit, dec!(500), ceiling(), now)
            .unwrap();
        assert_eq!(alloc.amount, dec!(500));
        assert!(warnings.is_empty());

        let usage = book.usage(&alice, ComplianceCategory::Deposit, now);
        assert_eq!(usage.daily_used, dec!(500));
        assert_eq!(usage.daily_resets_at, Some(now + Duration::hours(24)));
    }

    #[test]
    fn test_overflowing_amount_is_denied() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();
        let unbounded = Ceiling::new(Decimal::MAX, Decimal::MAX);

        book.charge(&alice, ComplianceCategory::Deposit, dec!(100), unbounded, now)
            .unwrap();
        let denial = book
            .charge(&alice, ComplianceCategory::Deposit, Decimal::MAX, unbounded, now)
            .unwrap_err();
        assert!(matches!(denial, DenialReason::DailyLimitExceeded { .. }));
        assert_eq!(
            book.usage(&alice, ComplianceCategory::Deposit, now).daily_used,
            dec!(100)
        );
    }

    #[test]
    fn test_precheck_does_not_charge() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();

        book.precheck(&alice, ComplianceCategory::Deposit, dec!(900), ceiling(), now)
            .unwrap();
        book.charge(&alice, ComplianceCategory::Deposit, dec!(900), ceiling(), now)
            .unwrap();
        assert!(matches!(
            book.precheck(&alice, ComplianceCategory::Deposit, dec!(200), ceiling(), now),
            Err(DenialReason::DailyLimitExceeded { .. })
        ));
        assert_eq!(
            book.usage(&alice, ComplianceCategory::Deposit, now).daily_used,
            dec!(900)
        );

        // an expired window no longer counts
        let later = now + Duration::hours(25);
        book.precheck(&alice, ComplianceCategory::Deposit, dec!(200), ceiling(), later)
            .unwrap();
    }

    #[test]
    fn test_exact_ceiling_is_allowed() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();

        book.charge(&alice, ComplianceCategory::Deposit, dec!(1000), ceiling(), now)
            .unwrap();
        let denial = book
            .charge(&alice, ComplianceCategory::Deposit, dec!(1), ceiling(), now)
            .unwrap_err();
        assert!(matches!(denial, DenialReason::DailyLimitExceeded { .. }));
    }

    #[test]
    fn test_denied_charge_does_not_mutate() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();

        assert!(book
            .charge(&alice, ComplianceCategory::Deposit, dec!(1001), ceiling(), now)
            .is_err());
        let usage = book.usage(&alice, ComplianceCategory::Deposit, now);
        assert_eq!(usage.daily_used, dec!(0));
        assert_eq!(usage.daily_resets_at, None);
    }

    #[test]
    fn test_warning_when_crossing_ratio() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();

        let (_, warnings) = book
            .charge(&alice, ComplianceCategory::Deposit, dec!(700), ceiling(), now)
            .unwrap();
        assert!(warnings.is_empty());

        let (_, warnings) = book
            .charge(&alice, ComplianceCategory::Deposit, dec!(150), ceiling(), now)
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].window, "daily");

        // already past the mark, no second warning
        let (_, warnings) = book
            .charge(&alice, ComplianceCategory::Deposit, dec!(10), ceiling(), now)
            .unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_window_rolls_from_first_use() {
        let book = book();
        let alice = AccountId::new("alice");
        let start = Utc::now();

        book.charge(&alice, ComplianceCategory::Deposit, dec!(900), ceiling(), start)
            .unwrap();
        // 23h later the window is still open
        assert!(book
            .charge(
                &alice,
                ComplianceCategory::Deposit,
                dec!(200),
                ceiling(),
                start + Duration::hours(23)
            )
            .is_err());

        let later = start + Duration::hours(25);
        let usage = book.usage(&alice, ComplianceCategory::Deposit, later);
        assert_eq!(usage.daily_used, dec!(0));
        assert_eq!(usage.monthly_used, dec!(900));
    }

    #[test]
    fn test_release_restores_usage() {
        let book = book();
        let alice = AccountId::new("alice");
        let now = Utc::now();

        let (alloc, _) = book
            .charge(&alice, ComplianceCategory::Withdrawal, dec!(400), ceiling(), now)
            .unwrap();
        assert!(book.release(&alloc, now));
        assert_eq!(
            book.usage(&alice, ComplianceCategory::Withdrawal, now).daily_used,
            dec!(0)
        );
    }

    #[test]
    fn test_release_after_reset_leaves_new_window_alone() {
        let book = book();
        let alice = AccountId::new("alice");
        let start = Utc::now();

        let (alloc, _) = book
            .charge(&alice, ComplianceCategory::Deposit, dec!(400), ceiling(), start)
            .unwrap();
        let later = start + Duration::hours(25);
        book.charge(&alice, ComplianceCategory::Deposit, dec!(300), ceiling(), later)
            .unwrap();

        book.release(&alloc, later);
        let usage = book.usage(&alice, ComplianceCategory::Deposit, later);
        assert_eq!(usage.daily_used, dec!(300));
        assert_eq!(usage.monthly_used, dec!(300));
    }
}
