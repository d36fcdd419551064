//! Property-based tests for the fine policy.
//!
//! - Property 1: A fine never exceeds the cap or the configured share of the debt
//! - Property 2: A fine is a whole multiple of the rounding unit
//! - Property 3: Balances that are not negative are never fined

use proptest::prelude::*;
use tabkeeper_shared::FineConfig;
use tabkeeper_shared::types::{Currency, Money};

use super::policy::FinePolicy;

fn config() -> impl Strategy<Value = FineConfig> {
    (1i64..=100, prop_oneof![Just(1i64), Just(5), Just(10), Just(50), Just(100)], 0i64..5_000)
        .prop_map(|(percentage, rounding, cap)| FineConfig {
            percentage,
            rounding,
            cap,
            ..FineConfig::default()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: fine <= cap and fine <= percentage of the debt.
    #[test]
    fn prop_fine_bounded(config in config(), debt in 1i64..10_000_000) {
        let policy = FinePolicy::new(config.clone());
        let fine = policy.fine_for(Money::new(-debt, Currency::Eur, 2));

        prop_assert!(fine.amount >= 0);
        prop_assert!(fine.amount <= config.cap);
        prop_assert!(fine.amount * 100 <= debt * config.percentage);
        prop_assert_eq!(fine.currency, Currency::Eur);
    }

    /// Property 2: the fine is rounded down to the rounding unit.
    #[test]
    fn prop_fine_rounded(config in config(), debt in 1i64..10_000_000) {
        let policy = FinePolicy::new(config.clone());
        let fine = policy.fine_for(Money::new(-debt, Currency::Eur, 2));

        prop_assert_eq!(fine.amount % config.rounding, 0);
    }

    /// Property 3: no fine without debt.
    #[test]
    fn prop_no_fine_without_debt(config in config(), balance in 0i64..10_000_000) {
        let policy = FinePolicy::new(config);
        prop_assert!(policy.fine_for(Money::new(balance, Currency::Eur, 2)).is_zero());
    }
}
