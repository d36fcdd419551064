//! Ledger events.
//!
//! A user's balance is derived from two append-only event streams:
//!
//! - **Transfers**: money moving between a user and the outside world, or
//!   between two users. Deposits, invoices, payouts, fines, waivers,
//!   write-offs and inactivity costs are all transfers.
//! - **Purchase rows**: line items of a point-of-sale checkout. The paying
//!   user is debited `quantity x unit price`, the selling user is credited
//!   the same amount.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabkeeper_shared::types::{
    Money, MoneyError, SubTransactionId, SubTransactionRowId, TransactionId, TransferId, UserId,
};

use super::error::LedgerError;

/// What caused a transfer.
///
/// Causes that come from outside the ledger (deposits, invoices, payouts)
/// carry the id of the external record. Causes owned by the ledger itself
/// (fines, waivers, write-offs, inactivity costs) are linked the other way
/// round: their own record references the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reference", rename_all = "snake_case")]
pub enum TransferCause {
    /// Money paid in by the user.
    Deposit(i64),
    /// An invoice charged to the user.
    Invoice(i64),
    /// Reversal of an invoice.
    InvoiceVoid(i64),
    /// Money paid out to the user.
    Payout(i64),
    /// A fine for staying in debt.
    Fine,
    /// Credit that cancels unpaid fines.
    FineWaiver,
    /// Credit that settles an unrecoverable debt.
    WriteOff,
    /// Administrative cost for an inactive account.
    InactivityCost,
    /// A transfer entered by hand.
    Manual,
}

impl TransferCause {
    /// Stable name stored next to the transfer.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Deposit(_) => "deposit",
            Self::Invoice(_) => "invoice",
            Self::InvoiceVoid(_) => "invoice_void",
            Self::Payout(_) => "payout",
            Self::Fine => "fine",
            Self::FineWaiver => "fine_waiver",
            Self::WriteOff => "write_off",
            Self::InactivityCost => "inactivity_cost",
            Self::Manual => "manual",
        }
    }

    /// Id of the external record, when the cause has one.
    #[must_use]
    pub const fn reference(&self) -> Option<i64> {
        match self {
            Self::Deposit(id) | Self::Invoice(id) | Self::InvoiceVoid(id) | Self::Payout(id) => {
                Some(*id)
            }
            Self::Fine
            | Self::FineWaiver
            | Self::WriteOff
            | Self::InactivityCost
            | Self::Manual => None,
        }
    }

    /// Whether only a ledger engine may record transfers with this cause.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(
            self,
            Self::Fine | Self::FineWaiver | Self::WriteOff | Self::InactivityCost
        )
    }

    /// Rebuilds a cause from its stored columns.
    pub fn from_parts(kind: &str, reference: Option<i64>) -> Result<Self, LedgerError> {
        let needs_reference = |build: fn(i64) -> Self| {
            reference
                .map(build)
                .ok_or_else(|| {
                    LedgerError::CorruptRow(format!("{kind} transfer without reference"))
                })
        };

        match kind {
            "deposit" => needs_reference(Self::Deposit),
            "invoice" => needs_reference(Self::Invoice),
            "invoice_void" => needs_reference(Self::InvoiceVoid),
            "payout" => needs_reference(Self::Payout),
            "fine" => Ok(Self::Fine),
            "fine_waiver" => Ok(Self::FineWaiver),
            "write_off" => Ok(Self::WriteOff),
            "inactivity_cost" => Ok(Self::InactivityCost),
            "manual" => Ok(Self::Manual),
            other => Err(LedgerError::CorruptRow(format!("unknown transfer cause '{other}'"))),
        }
    }
}

/// A stored transfer.
///
/// `from = None` means money enters the system, `to = None` means it leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Transfer ID. Ids increase with insertion order.
    pub id: TransferId,
    /// Debited user.
    pub from: Option<UserId>,
    /// Credited user.
    pub to: Option<UserId>,
    /// Always positive.
    pub amount: Money,
    /// Free-form description.
    pub description: Option<String>,
    /// What caused the transfer.
    pub cause: TransferCause,
    /// When the transfer was recorded.
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    /// Signed effect of this transfer on `user_id`, or `None` if the user is
    /// not a party.
    #[must_use]
    pub fn effect_on(&self, user_id: UserId) -> Option<Money> {
        match (self.from == Some(user_id), self.to == Some(user_id)) {
            (true, true) => Some(self.amount.zero_like()),
            (true, false) => Some(self.amount.negate()),
            (false, true) => Some(self.amount),
            (false, false) => None,
        }
    }

    /// Users on either side of the transfer.
    #[must_use]
    pub fn parties(&self) -> Vec<UserId> {
        parties(self.from, self.to)
    }
}

/// Input for a new transfer. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    /// Debited user.
    pub from: Option<UserId>,
    /// Credited user.
    pub to: Option<UserId>,
    /// Must be positive and in the ledger currency.
    pub amount: Money,
    /// Free-form description.
    pub description: Option<String>,
    /// What caused the transfer.
    pub cause: TransferCause,
}

impl NewTransfer {
    /// Money leaving `user_id` towards the outside world.
    #[must_use]
    pub const fn debit(user_id: UserId, amount: Money, cause: TransferCause) -> Self {
        Self {
            from: Some(user_id),
            to: None,
            amount,
            description: None,
            cause,
        }
    }

    /// Money entering `user_id` from the outside world.
    #[must_use]
    pub const fn credit(user_id: UserId, amount: Money, cause: TransferCause) -> Self {
        Self {
            from: None,
            to: Some(user_id),
            amount,
            description: None,
            cause,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Users on either side of the transfer.
    #[must_use]
    pub fn parties(&self) -> Vec<UserId> {
        parties(self.from, self.to)
    }
}

fn parties(from: Option<UserId>, to: Option<UserId>) -> Vec<UserId> {
    let mut users: Vec<UserId> = from.into_iter().chain(to).collect();
    users.sort_unstable();
    users.dedup();
    users
}

/// One purchased line item of a checkout, flattened with the ids and
/// parties of its transaction and sub transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRow {
    /// Row ID.
    pub id: SubTransactionRowId,
    /// Checkout the row belongs to. Ids increase with insertion order.
    pub transaction_id: TransactionId,
    /// Per-container part of the checkout.
    pub sub_transaction_id: SubTransactionId,
    /// User who pays.
    pub payer: UserId,
    /// User who owns the container the product was sold from.
    pub seller: UserId,
    /// Product sold.
    pub product_id: i64,
    /// Product revision at the time of sale.
    pub product_revision: i32,
    /// Units sold.
    pub quantity: i64,
    /// Price per unit including VAT.
    pub unit_price: Money,
    /// When the checkout was recorded.
    pub created_at: DateTime<Utc>,
}

impl PurchaseRow {
    /// `quantity x unit price`.
    pub const fn total(&self) -> Result<Money, MoneyError> {
        self.unit_price.multiply(self.quantity)
    }

    /// Whether `user_id` is payer or seller.
    #[must_use]
    pub const fn involves(&self, user_id: UserId) -> bool {
        self.payer.0 == user_id.0 || self.seller.0 == user_id.0
    }

    /// Signed effect of this row on `user_id`, or `None` if the user is
    /// neither payer nor seller.
    pub fn effect_on(&self, user_id: UserId) -> Result<Option<Money>, MoneyError> {
        if !self.involves(user_id) {
            return Ok(None);
        }
        let total = self.total()?;
        Ok(Some(match (self.payer == user_id, self.seller == user_id) {
            (true, true) => total.zero_like(),
            (true, false) => total.negate(),
            _ => total,
        }))
    }
}

/// Input for a checkout at a point of sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckout {
    /// User who pays.
    pub payer: UserId,
    /// User who operated the point of sale.
    pub created_by: UserId,
    /// Point of sale the checkout happened at.
    pub point_of_sale_id: Option<i64>,
    /// One entry per container products were taken from.
    pub sub_transactions: Vec<NewSubTransaction>,
}

/// The part of a checkout sold from one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubTransaction {
    /// Owner of the container; credited for the rows.
    pub seller: UserId,
    /// Container the products were taken from.
    pub container_id: i64,
    /// Line items.
    pub rows: Vec<NewPurchaseRow>,
}

/// A line item of a new checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchaseRow {
    /// Product sold.
    pub product_id: i64,
    /// Product revision at the time of sale.
    pub product_revision: i32,
    /// Units sold.
    pub quantity: i64,
    /// Price per unit including VAT.
    pub unit_price: Money,
}

impl NewCheckout {
    /// Users whose balance the checkout changes, ascending.
    #[must_use]
    pub fn parties(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = std::iter::once(self.payer)
            .chain(self.sub_transactions.iter().map(|sub| sub.seller))
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Every row of the checkout.
    pub fn rows(&self) -> impl Iterator<Item = &NewPurchaseRow> {
        self.sub_transactions.iter().flat_map(|sub| sub.rows.iter())
    }

    /// Sum of all row totals, starting from `zero`.
    pub fn total(&self, zero: Money) -> Result<Money, MoneyError> {
        self.rows()
            .try_fold(zero, |sum, row| sum.checked_add(row.total()?))
    }
}

impl NewPurchaseRow {
    /// `quantity x unit price`.
    pub const fn total(&self) -> Result<Money, MoneyError> {
        self.unit_price.multiply(self.quantity)
    }
}

/// A recorded checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    /// Checkout ID.
    pub id: TransactionId,
    /// The payer.
    pub payer: UserId,
    /// When the checkout was recorded.
    pub created_at: DateTime<Utc>,
    /// Every row, flattened.
    pub rows: Vec<PurchaseRow>,
}

/// Bound for historical balance queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cutoff {
    /// Transfers up to and including this id, and purchases dated at or
    /// before that transfer.
    Transfer(TransferId),
    /// Every event dated at or before this instant.
    Date(DateTime<Utc>),
}

/// Which events of a user a store query returns.
///
/// All bounds are optional. `after_*` bounds are exclusive, `until_*`
/// bounds inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRange {
    /// Only transfers with a larger id.
    pub after_transfer: Option<TransferId>,
    /// Only purchases of checkouts with a larger id.
    pub after_transaction: Option<TransactionId>,
    /// Only transfers up to this id.
    pub until_transfer: Option<TransferId>,
    /// Only events dated at or before this instant.
    pub until_date: Option<DateTime<Utc>>,
}

impl EventRange {
    /// The complete history.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Events newer than the given watermarks.
    #[must_use]
    pub const fn after(
        transfer: Option<TransferId>,
        transaction: Option<TransactionId>,
    ) -> Self {
        Self {
            after_transfer: transfer,
            after_transaction: transaction,
            until_transfer: None,
            until_date: None,
        }
    }

    /// Returns true if a transfer falls inside the range.
    #[must_use]
    pub fn contains_transfer(&self, transfer: &Transfer) -> bool {
        self.after_transfer.is_none_or(|after| transfer.id > after)
            && self.until_transfer.is_none_or(|until| transfer.id <= until)
            && self.until_date.is_none_or(|until| transfer.created_at <= until)
    }

    /// Returns true if a purchase row falls inside the range.
    #[must_use]
    pub fn contains_purchase(&self, row: &PurchaseRow) -> bool {
        self.after_transaction.is_none_or(|after| row.transaction_id > after)
            && self.until_date.is_none_or(|until| row.created_at <= until)
    }
}

/// A transfer or a purchase row, for walking a user's history in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEvent<'a> {
    /// A transfer.
    Transfer(&'a Transfer),
    /// A purchased line item.
    Purchase(&'a PurchaseRow),
}

impl LedgerEvent<'_> {
    /// When the event was recorded.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Transfer(transfer) => transfer.created_at,
            Self::Purchase(row) => row.created_at,
        }
    }

    /// Whether the event changes the balance of `user_id`.
    #[must_use]
    pub fn involves(&self, user_id: UserId) -> bool {
        match self {
            Self::Transfer(transfer) => transfer.effect_on(user_id).is_some(),
            Self::Purchase(row) => row.involves(user_id),
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, u8, i64) {
        match self {
            Self::Transfer(transfer) => (transfer.created_at, 0, transfer.id.0),
            Self::Purchase(row) => (row.created_at, 1, row.id.0),
        }
    }
}

/// Merges both streams into one, ordered by `(created_at, kind, id)`.
#[must_use]
pub fn chronological<'a>(
    transfers: &'a [Transfer],
    purchases: &'a [PurchaseRow],
) -> Vec<LedgerEvent<'a>> {
    let mut events: Vec<LedgerEvent<'a>> = transfers
        .iter()
        .map(LedgerEvent::Transfer)
        .chain(purchases.iter().map(LedgerEvent::Purchase))
        .collect();
    events.sort_by_key(LedgerEvent::sort_key);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use tabkeeper_shared::types::Currency;

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::Eur, 2)
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    fn transfer(id: i64, from: Option<i64>, to: Option<i64>, amount: i64, day: u32) -> Transfer {
        Transfer {
            id: TransferId(id),
            from: from.map(UserId),
            to: to.map(UserId),
            amount: eur(amount),
            description: None,
            cause: TransferCause::Manual,
            created_at: at(day),
        }
    }

    fn row(id: i64, payer: i64, seller: i64, quantity: i64, price: i64, day: u32) -> PurchaseRow {
        PurchaseRow {
            id: SubTransactionRowId(id),
            transaction_id: TransactionId(id),
            sub_transaction_id: SubTransactionId(id),
            payer: UserId(payer),
            seller: UserId(seller),
            product_id: 1,
            product_revision: 1,
            quantity,
            unit_price: eur(price),
            created_at: at(day),
        }
    }

    #[test]
    fn test_transfer_effect() {
        let t = transfer(1, Some(1), Some(2), 500, 1);
        assert_eq!(t.effect_on(UserId(1)), Some(eur(-500)));
        assert_eq!(t.effect_on(UserId(2)), Some(eur(500)));
        assert_eq!(t.effect_on(UserId(3)), None);

        let own = transfer(2, Some(4), Some(4), 500, 1);
        assert_eq!(own.effect_on(UserId(4)), Some(eur(0)));
    }

    #[test]
    fn test_purchase_effect() {
        let r = row(1, 1, 2, 3, 150, 1);
        assert_eq!(r.total(), Ok(eur(450)));
        assert_eq!(r.effect_on(UserId(1)), Ok(Some(eur(-450))));
        assert_eq!(r.effect_on(UserId(2)), Ok(Some(eur(450))));
        assert_eq!(r.effect_on(UserId(9)), Ok(None));
        assert!(r.involves(UserId(2)));
        assert!(!r.involves(UserId(9)));

        let huge = row(2, 1, 2, i64::MAX / 2, 1050, 1);
        assert_eq!(huge.effect_on(UserId(1)), Err(MoneyError::Overflow));
        assert_eq!(huge.effect_on(UserId(9)), Ok(None));
    }

    #[rstest]
    #[case(TransferCause::Deposit(11))]
    #[case(TransferCause::Invoice(12))]
    #[case(TransferCause::InvoiceVoid(12))]
    #[case(TransferCause::Payout(13))]
    #[case(TransferCause::Fine)]
    #[case(TransferCause::FineWaiver)]
    #[case(TransferCause::WriteOff)]
    #[case(TransferCause::InactivityCost)]
    #[case(TransferCause::Manual)]
    fn test_cause_survives_storage(#[case] cause: TransferCause) {
        let rebuilt = TransferCause::from_parts(cause.kind(), cause.reference()).unwrap();
        assert_eq!(rebuilt, cause);
    }

    #[test]
    fn test_cause_rejects_corrupt_columns() {
        assert!(matches!(
            TransferCause::from_parts("deposit", None),
            Err(LedgerError::CorruptRow(_))
        ));
        assert!(matches!(
            TransferCause::from_parts("gift", Some(1)),
            Err(LedgerError::CorruptRow(_))
        ));
    }

    #[test]
    fn test_cause_json_shape() {
        let json = serde_json::to_value(TransferCause::Invoice(42)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "invoice", "reference": 42}));
    }

    #[test]
    fn test_range_bounds() {
        let range = EventRange {
            after_transfer: Some(TransferId(2)),
            after_transaction: Some(TransactionId(5)),
            until_transfer: Some(TransferId(4)),
            until_date: Some(at(10)),
        };
        assert!(!range.contains_transfer(&transfer(2, None, Some(1), 1, 1)));
        assert!(range.contains_transfer(&transfer(3, None, Some(1), 1, 1)));
        assert!(range.contains_transfer(&transfer(4, None, Some(1), 1, 10)));
        assert!(!range.contains_transfer(&transfer(4, None, Some(1), 1, 11)));
        assert!(!range.contains_transfer(&transfer(5, None, Some(1), 1, 1)));

        assert!(!range.contains_purchase(&row(5, 1, 2, 1, 1, 1)));
        assert!(range.contains_purchase(&row(6, 1, 2, 1, 1, 10)));
        assert!(!range.contains_purchase(&row(7, 1, 2, 1, 1, 11)));
    }

    #[test]
    fn test_chronological_order() {
        let transfers = vec![
            transfer(1, None, Some(1), 100, 3),
            transfer(2, None, Some(1), 100, 1),
        ];
        let purchases = vec![row(1, 1, 2, 1, 50, 2), row(2, 1, 2, 1, 50, 3)];

        let order: Vec<DateTime<Utc>> = chronological(&transfers, &purchases)
            .iter()
            .map(LedgerEvent::created_at)
            .collect();
        assert_eq!(order, vec![at(1), at(2), at(3), at(3)]);

        // Same timestamp: transfers first.
        let events = chronological(&transfers, &purchases);
        assert!(matches!(events[2], LedgerEvent::Transfer(t) if t.id == TransferId(1)));
    }

    #[test]
    fn test_checkout_parties_are_sorted_and_unique() {
        let checkout = NewCheckout {
            payer: UserId(5),
            created_by: UserId(5),
            point_of_sale_id: None,
            sub_transactions: vec![
                NewSubTransaction {
                    seller: UserId(9),
                    container_id: 1,
                    rows: vec![],
                },
                NewSubTransaction {
                    seller: UserId(2),
                    container_id: 2,
                    rows: vec![],
                },
                NewSubTransaction {
                    seller: UserId(9),
                    container_id: 3,
                    rows: vec![],
                },
            ],
        };
        assert_eq!(checkout.parties(), vec![UserId(2), UserId(5), UserId(9)]);
    }
}
