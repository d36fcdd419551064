//! Balance aggregation.
//!
//! A balance is the sum of a user's signed event effects. Aggregation is a
//! fold, so it can start from zero (a full rescan) or from a cached balance
//! plus everything after its watermarks (incremental). Both must agree:
//!
//! ```text
//! aggregate(all events) == aggregate(seed = aggregate(prefix), rest)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabkeeper_shared::types::{Money, TransactionId, TransferId, UserId};

use super::error::LedgerError;
use super::event::{LedgerEvent, PurchaseRow, Transfer, chronological};

/// A user's balance together with the watermarks of the events it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// The user.
    pub user_id: UserId,
    /// Signed balance.
    pub amount: Money,
    /// Highest transfer folded into the balance.
    pub last_transfer_id: Option<TransferId>,
    /// Latest date among the folded transfers.
    pub last_transfer_date: Option<DateTime<Utc>>,
    /// Highest checkout folded into the balance.
    pub last_transaction_id: Option<TransactionId>,
    /// Latest date among the folded purchases.
    pub last_transaction_date: Option<DateTime<Utc>>,
}

impl Balance {
    /// A balance with no events.
    #[must_use]
    pub const fn zero(user_id: UserId, zero: Money) -> Self {
        Self {
            user_id,
            amount: zero,
            last_transfer_id: None,
            last_transfer_date: None,
            last_transaction_id: None,
            last_transaction_date: None,
        }
    }
}

/// A cached balance as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBalance {
    /// The cached value.
    pub balance: Balance,
    /// When the cache row was written.
    pub updated_at: DateTime<Utc>,
}

/// Folds events into a balance.
#[derive(Debug, Clone)]
pub struct BalanceAccumulator {
    balance: Balance,
}

impl BalanceAccumulator {
    /// Starts from zero.
    #[must_use]
    pub const fn new(user_id: UserId, zero: Money) -> Self {
        Self {
            balance: Balance::zero(user_id, zero),
        }
    }

    /// Starts from a previously computed balance.
    #[must_use]
    pub const fn resume(seed: Balance) -> Self {
        Self { balance: seed }
    }

    /// Current running amount.
    #[must_use]
    pub const fn amount(&self) -> Money {
        self.balance.amount
    }

    /// Folds one event. Events that do not involve the user are ignored.
    pub fn apply(&mut self, event: LedgerEvent<'_>) -> Result<(), LedgerError> {
        match event {
            LedgerEvent::Transfer(transfer) => self.apply_transfer(transfer),
            LedgerEvent::Purchase(row) => self.apply_purchase(row),
        }
    }

    /// Folds a transfer.
    pub fn apply_transfer(&mut self, transfer: &Transfer) -> Result<(), LedgerError> {
        let Some(effect) = transfer.effect_on(self.balance.user_id) else {
            return Ok(());
        };
        self.add(effect)?;
        self.balance.last_transfer_id = self.balance.last_transfer_id.max(Some(transfer.id));
        self.balance.last_transfer_date =
            self.balance.last_transfer_date.max(Some(transfer.created_at));
        Ok(())
    }

    /// Folds a purchase row.
    pub fn apply_purchase(&mut self, row: &PurchaseRow) -> Result<(), LedgerError> {
        let user_id = self.balance.user_id;
        let Some(effect) = row
            .effect_on(user_id)
            .map_err(|err| LedgerError::in_ledger_of(user_id, err))?
        else {
            return Ok(());
        };
        self.add(effect)?;
        self.balance.last_transaction_id =
            self.balance.last_transaction_id.max(Some(row.transaction_id));
        self.balance.last_transaction_date =
            self.balance.last_transaction_date.max(Some(row.created_at));
        Ok(())
    }

    /// Returns the folded balance.
    #[must_use]
    pub fn finish(self) -> Balance {
        self.balance
    }

    fn add(&mut self, effect: Money) -> Result<(), LedgerError> {
        let user_id = self.balance.user_id;
        self.balance.amount = self
            .balance
            .amount
            .checked_add(effect)
            .map_err(|err| LedgerError::in_ledger_of(user_id, err))?;
        Ok(())
    }
}

/// Aggregates a user's events, optionally on top of a seed balance.
///
/// With a seed, `transfers` and `purchases` must be the events after the
/// seed's watermarks; the caller selects them.
pub fn aggregate(
    user_id: UserId,
    zero: Money,
    seed: Option<Balance>,
    transfers: &[Transfer],
    purchases: &[PurchaseRow],
) -> Result<Balance, LedgerError> {
    let mut acc = match seed {
        Some(seed) => BalanceAccumulator::resume(seed),
        None => BalanceAccumulator::new(user_id, zero),
    };
    for transfer in transfers {
        acc.apply_transfer(transfer)?;
    }
    for row in purchases {
        acc.apply_purchase(row)?;
    }
    Ok(acc.finish())
}

/// Result of walking a user's full history in time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebtStreak {
    /// Balance after the last event.
    pub balance: Money,
    /// When the balance last went from non-negative to negative, if it is
    /// negative now.
    pub since: Option<DateTime<Utc>>,
}

/// Walks the complete history in time order and finds when the current
/// uninterrupted negative streak began.
pub fn debt_streak(
    user_id: UserId,
    zero: Money,
    transfers: &[Transfer],
    purchases: &[PurchaseRow],
) -> Result<DebtStreak, LedgerError> {
    let mut acc = BalanceAccumulator::new(user_id, zero);
    let mut since = None;

    for event in chronological(transfers, purchases) {
        if !event.involves(user_id) {
            continue;
        }
        let was_negative = acc.amount().is_negative();
        acc.apply(event)?;
        match (was_negative, acc.amount().is_negative()) {
            (false, true) => since = Some(event.created_at()),
            (true, false) => since = None,
            _ => {}
        }
    }

    Ok(DebtStreak {
        balance: acc.amount(),
        since,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::TransferCause;
    use chrono::TimeZone;
    use tabkeeper_shared::types::{Currency, SubTransactionId, SubTransactionRowId};

    const USER: UserId = UserId(1);
    const OTHER: UserId = UserId(2);

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::Eur, 2)
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 9, 30, 0).unwrap()
    }

    fn deposit(id: i64, amount: i64, day: u32) -> Transfer {
        Transfer {
            id: TransferId(id),
            from: None,
            to: Some(USER),
            amount: eur(amount),
            description: None,
            cause: TransferCause::Deposit(id),
            created_at: at(day),
        }
    }

    fn charge(id: i64, amount: i64, day: u32, cause: TransferCause) -> Transfer {
        Transfer {
            id: TransferId(id),
            from: Some(USER),
            to: None,
            amount: eur(amount),
            description: None,
            cause,
            created_at: at(day),
        }
    }

    fn purchase(tx: i64, quantity: i64, price: i64, day: u32) -> PurchaseRow {
        PurchaseRow {
            id: SubTransactionRowId(tx * 10),
            transaction_id: TransactionId(tx),
            sub_transaction_id: SubTransactionId(tx),
            payer: USER,
            seller: OTHER,
            product_id: 3,
            product_revision: 1,
            quantity,
            unit_price: eur(price),
            created_at: at(day),
        }
    }

    #[test]
    fn test_empty_history_is_zero() {
        let balance = aggregate(USER, eur(0), None, &[], &[]).unwrap();
        assert_eq!(balance, Balance::zero(USER, eur(0)));
    }

    #[test]
    fn test_deposit_purchase_fine() {
        // Deposit 3900, buy 3 x 700, then a fine of 500.
        let transfers = vec![deposit(1, 3900, 1), charge(2, 500, 3, TransferCause::Fine)];
        let purchases = vec![purchase(1, 3, 700, 2)];

        let balance = aggregate(USER, eur(0), None, &transfers, &purchases).unwrap();
        assert_eq!(balance.amount, eur(1300));
        assert_eq!(balance.last_transfer_id, Some(TransferId(2)));
        assert_eq!(balance.last_transfer_date, Some(at(3)));
        assert_eq!(balance.last_transaction_id, Some(TransactionId(1)));
    }

    #[test]
    fn test_seller_is_credited() {
        let balance = aggregate(OTHER, eur(0), None, &[], &[purchase(1, 2, 250, 1)]).unwrap();
        assert_eq!(balance.amount, eur(500));
        assert_eq!(balance.last_transaction_id, Some(TransactionId(1)));
        assert_eq!(balance.last_transfer_id, None);
    }

    #[test]
    fn test_unrelated_events_do_not_move_watermarks() {
        let foreign = Transfer {
            to: Some(OTHER),
            ..deposit(9, 100, 1)
        };
        let balance = aggregate(USER, eur(0), None, &[foreign], &[]).unwrap();
        assert_eq!(balance.amount, eur(0));
        assert_eq!(balance.last_transfer_id, None);
    }

    #[test]
    fn test_incremental_matches_full() {
        let transfers = vec![
            deposit(1, 2000, 1),
            charge(2, 300, 2, TransferCause::Payout(1)),
            deposit(3, 500, 4),
        ];
        let purchases = vec![purchase(1, 1, 150, 2), purchase(2, 4, 80, 5)];

        let full = aggregate(USER, eur(0), None, &transfers, &purchases).unwrap();
        let seed = aggregate(USER, eur(0), None, &transfers[..2], &purchases[..1]).unwrap();
        let incremental =
            aggregate(USER, eur(0), Some(seed), &transfers[2..], &purchases[1..]).unwrap();

        assert_eq!(incremental, full);
    }

    #[test]
    fn test_currency_mismatch_is_data_integrity() {
        let mut usd = deposit(2, 100, 2);
        usd.amount = Money::new(100, Currency::Usd, 2);

        let err = aggregate(USER, eur(0), None, &[deposit(1, 100, 1), usd], &[]).unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { user_id, .. } if user_id == USER));
        assert!(err.is_data_integrity());
    }

    #[test]
    fn test_debt_streak_starts_when_balance_turns_negative() {
        let transfers = vec![deposit(1, 1000, 1), deposit(2, 100, 10)];
        let purchases = vec![purchase(1, 1, 1500, 4), purchase(2, 1, 50, 12)];

        let streak = debt_streak(USER, eur(0), &transfers, &purchases).unwrap();
        assert_eq!(streak.balance, eur(-450));
        assert_eq!(streak.since, Some(at(4)));
    }

    #[test]
    fn test_debt_streak_resets_when_balance_recovers() {
        let transfers = vec![deposit(1, 1000, 6)];
        let purchases = vec![purchase(1, 1, 500, 2), purchase(2, 1, 800, 8)];

        // -500 on day 2, +500 on day 6, -300 on day 8.
        let streak = debt_streak(USER, eur(0), &transfers, &purchases).unwrap();
        assert_eq!(streak.balance, eur(-300));
        assert_eq!(streak.since, Some(at(8)));
    }

    #[test]
    fn test_debt_streak_none_when_not_negative() {
        let streak = debt_streak(USER, eur(0), &[deposit(1, 10, 1)], &[]).unwrap();
        assert_eq!(streak.balance, eur(10));
        assert_eq!(streak.since, None);
    }
}
