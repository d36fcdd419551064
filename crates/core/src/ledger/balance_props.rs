//! Property-based tests for balance aggregation.
//!
//! - Property 1: Aggregation equals the naive signed sum
//! - Property 2: Incremental aggregation equals a full rescan
//! - Property 3: Aggregation does not depend on event order
//! - Property 4: The history walk agrees with aggregation

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use proptest::sample::Index;
use tabkeeper_shared::types::{
    Currency, Money, SubTransactionId, SubTransactionRowId, TransactionId, TransferId, UserId,
};

use super::balance::{aggregate, debt_streak};
use super::event::{PurchaseRow, Transfer, TransferCause};

const USER: UserId = UserId(1);

fn eur(amount: i64) -> Money {
    Money::new(amount, Currency::Eur, 2)
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
}

/// Parties drawn from the user under test, another user and the outside.
fn party() -> impl Strategy<Value = Option<UserId>> {
    prop_oneof![Just(Some(USER)), Just(Some(UserId(2))), Just(Some(UserId(3))), Just(None)]
}

fn member() -> impl Strategy<Value = UserId> {
    prop_oneof![Just(USER), Just(UserId(2)), Just(UserId(3))]
}

/// Transfers with ascending ids and random dates.
fn transfers() -> impl Strategy<Value = Vec<Transfer>> {
    prop::collection::vec((party(), party(), 1i64..100_000, 0i64..720), 0..25).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .filter(|(_, (from, to, _, _))| from.is_some() || to.is_some())
            .map(|(i, (from, to, amount, hours))| Transfer {
                id: TransferId(i64::try_from(i).unwrap() + 1),
                from,
                to,
                amount: eur(amount),
                description: None,
                cause: TransferCause::Manual,
                created_at: base() + TimeDelta::hours(hours),
            })
            .collect()
    })
}

/// Purchase rows with ascending checkout ids and random dates.
fn purchases() -> impl Strategy<Value = Vec<PurchaseRow>> {
    prop::collection::vec((member(), member(), 1i64..6, 0i64..2_500, 0i64..720), 0..25).prop_map(
        |raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (payer, seller, quantity, price, hours))| {
                    let id = i64::try_from(i).unwrap() + 1;
                    PurchaseRow {
                        id: SubTransactionRowId(id),
                        transaction_id: TransactionId(id),
                        sub_transaction_id: SubTransactionId(id),
                        payer,
                        seller,
                        product_id: 1,
                        product_revision: 1,
                        quantity,
                        unit_price: eur(price),
                        created_at: base() + TimeDelta::hours(hours),
                    }
                })
                .collect()
        },
    )
}

/// Straightforward signed sum, written independently of the accumulator.
fn naive_sum(user: UserId, transfers: &[Transfer], purchases: &[PurchaseRow]) -> i64 {
    let mut sum = 0;
    for t in transfers {
        if t.to == Some(user) {
            sum += t.amount.amount;
        }
        if t.from == Some(user) {
            sum -= t.amount.amount;
        }
    }
    for row in purchases {
        let total = row.quantity * row.unit_price.amount;
        if row.seller == user {
            sum += total;
        }
        if row.payer == user {
            sum -= total;
        }
    }
    sum
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: For any history, the aggregated amount equals the signed
    /// sum of transfers and purchase rows touching the user.
    #[test]
    fn prop_aggregate_equals_naive_sum(
        transfers in transfers(),
        purchases in purchases(),
    ) {
        let balance = aggregate(USER, eur(0), None, &transfers, &purchases).unwrap();
        prop_assert_eq!(balance.amount, eur(naive_sum(USER, &transfers, &purchases)));
    }

    /// Property 2: Aggregating a prefix, then the rest on top of it, gives
    /// exactly the full rescan, watermarks included.
    #[test]
    fn prop_incremental_equals_full(
        transfers in transfers(),
        purchases in purchases(),
        transfer_split in any::<Index>(),
        purchase_split in any::<Index>(),
    ) {
        let ts = transfer_split.index(transfers.len() + 1);
        let ps = purchase_split.index(purchases.len() + 1);

        let full = aggregate(USER, eur(0), None, &transfers, &purchases).unwrap();
        let seed = aggregate(USER, eur(0), None, &transfers[..ts], &purchases[..ps]).unwrap();
        let incremental =
            aggregate(USER, eur(0), Some(seed), &transfers[ts..], &purchases[ps..]).unwrap();

        prop_assert_eq!(incremental, full);
    }

    /// Property 3: The fold is order independent.
    #[test]
    fn prop_aggregate_order_independent(
        transfers in transfers(),
        purchases in purchases(),
    ) {
        let forward = aggregate(USER, eur(0), None, &transfers, &purchases).unwrap();

        let mut reversed_transfers = transfers.clone();
        reversed_transfers.reverse();
        let mut reversed_purchases = purchases.clone();
        reversed_purchases.reverse();
        let backward =
            aggregate(USER, eur(0), None, &reversed_transfers, &reversed_purchases).unwrap();

        prop_assert_eq!(forward, backward);
    }

    /// Property 4: Walking the history in time order ends at the aggregated
    /// balance, and a debt streak exists exactly when that balance is negative.
    #[test]
    fn prop_streak_agrees_with_aggregate(
        transfers in transfers(),
        purchases in purchases(),
    ) {
        let balance = aggregate(USER, eur(0), None, &transfers, &purchases).unwrap();
        let streak = debt_streak(USER, eur(0), &transfers, &purchases).unwrap();

        prop_assert_eq!(streak.balance, balance.amount);
        prop_assert_eq!(streak.since.is_some(), balance.amount.is_negative());
    }
}
