//! Fine policy: how much, and when.

use chrono::{DateTime, Utc};
use tabkeeper_shared::FineConfig;
use tabkeeper_shared::types::Money;

use super::types::DebtState;
use crate::ledger::DebtStreak;

/// Pure fine rules, configured by [`FineConfig`].
#[derive(Debug, Clone)]
pub struct FinePolicy {
    config: FineConfig,
}

impl FinePolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(config: FineConfig) -> Self {
        Self { config }
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &FineConfig {
        &self.config
    }

    /// Fine for a balance: a percentage of the debt, capped, then rounded
    /// down to the rounding unit. Zero for balances that are not negative.
    #[must_use]
    pub fn fine_for(&self, balance: Money) -> Money {
        if !balance.is_negative() {
            return balance.zero_like();
        }

        let debt = balance.amount.checked_neg().unwrap_or(i64::MAX);
        let raw = debt.saturating_mul(self.config.percentage.max(0)) / 100;
        let capped = raw.min(self.config.cap.max(0));
        let rounding = self.config.rounding.max(1);
        Money::new(capped - capped % rounding, balance.currency, balance.precision)
    }

    /// Whether a fine is due at `now` for a streak that began at `since`.
    ///
    /// The threshold counts from the start of the streak, or from the last
    /// fine of the streak if one was issued since.
    #[must_use]
    pub fn is_due(
        &self,
        since: DateTime<Utc>,
        last_fine_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let from = last_fine_at.map_or(since, |last| last.max(since));
        now - from >= self.config.threshold()
    }

    /// Debt lifecycle state for a streak with `fine_count` unpaid fines.
    #[must_use]
    pub const fn state(&self, streak: &DebtStreak, fine_count: u32) -> DebtState {
        match streak.since {
            None => DebtState::NoDebt,
            Some(since) if fine_count == 0 => DebtState::InDebt { since },
            Some(since) if fine_count >= self.config.write_off_candidate_fines => {
                DebtState::WriteOffCandidate {
                    since,
                    count: fine_count,
                }
            }
            Some(since) => DebtState::Fined {
                since,
                count: fine_count,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use rstest::rstest;
    use tabkeeper_shared::types::Currency;

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::Eur, 2)
    }

    fn policy() -> FinePolicy {
        FinePolicy::new(FineConfig::default())
    }

    #[rstest]
    #[case(-1800, 360)]
    #[case(-1234, 240)]
    #[case(-49, 0)]
    #[case(-2500, 500)]
    #[case(-1_000_000, 500)]
    #[case(0, 0)]
    #[case(700, 0)]
    fn test_fine_amount(#[case] balance: i64, #[case] expected: i64) {
        assert_eq!(policy().fine_for(eur(balance)), eur(expected));
    }

    #[test]
    fn test_due_after_threshold() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let p = policy();

        assert!(!p.is_due(since, None, since + TimeDelta::days(29)));
        assert!(p.is_due(since, None, since + TimeDelta::days(30)));

        let last_fine = since + TimeDelta::days(30);
        assert!(!p.is_due(since, Some(last_fine), since + TimeDelta::days(45)));
        assert!(p.is_due(since, Some(last_fine), since + TimeDelta::days(60)));
    }

    #[test]
    fn test_fine_before_streak_does_not_count() {
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let old_fine = since - TimeDelta::days(10);
        assert!(policy().is_due(since, Some(old_fine), since + TimeDelta::days(30)));
    }

    #[test]
    fn test_state_transitions() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let p = policy();
        let in_debt = DebtStreak {
            balance: eur(-100),
            since: Some(since),
        };
        let clear = DebtStreak {
            balance: eur(100),
            since: None,
        };

        assert_eq!(p.state(&clear, 3), DebtState::NoDebt);
        assert_eq!(p.state(&in_debt, 0), DebtState::InDebt { since });
        assert_eq!(p.state(&in_debt, 4), DebtState::Fined { since, count: 4 });
        assert_eq!(
            p.state(&in_debt, 5),
            DebtState::WriteOffCandidate { since, count: 5 }
        );
    }
}
