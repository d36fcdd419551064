//! Conversions between entity models and ledger values.
//!
//! Every conversion from a stored row is fallible: a row that cannot be
//! mapped back is reported as [`LedgerError::CorruptRow`].

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use tabkeeper_core::fines::{Fine, FineGroup, WriteOff};
use tabkeeper_core::inactivity::InactivityCost;
use tabkeeper_core::ledger::{Balance, CachedBalance, LedgerError, Transfer, TransferCause};
use tabkeeper_core::store::LedgerUser;
use tabkeeper_shared::types::{
    Currency, FineGroupId, FineId, InactivityCostId, Money, TransactionId, TransferId, UserId,
    WriteOffId,
};

use crate::entities::{
    balances, fines, inactive_administrative_costs, transfers, user_fine_groups, users, write_offs,
};

pub(crate) fn to_utc(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

pub(crate) fn to_db(value: DateTime<Utc>) -> DateTime<FixedOffset> {
    value.fixed_offset()
}

pub(crate) fn money(amount: i64, currency: &str, precision: i16) -> Result<Money, LedgerError> {
    let currency: Currency = currency.parse().map_err(LedgerError::CorruptRow)?;
    let precision = u32::try_from(precision)
        .map_err(|_| LedgerError::CorruptRow(format!("negative precision {precision}")))?;
    Ok(Money::new(amount, currency, precision))
}

pub(crate) fn precision(value: Money) -> Result<i16, LedgerError> {
    i16::try_from(value.precision)
        .map_err(|_| LedgerError::Internal(format!("precision {} out of range", value.precision)))
}

pub(crate) fn user(model: users::Model) -> LedgerUser {
    LedgerUser {
        id: UserId(model.id),
        active: model.active,
        inactive_notified: model.inactive_notified,
        current_fine_group: model.current_fines_id.map(FineGroupId),
        created_at: to_utc(model.created_at),
    }
}

pub(crate) fn transfer(model: transfers::Model) -> Result<Transfer, LedgerError> {
    Ok(Transfer {
        id: TransferId(model.id),
        from: model.from_user_id.map(UserId),
        to: model.to_user_id.map(UserId),
        amount: money(model.amount, &model.currency, model.precision)?,
        cause: TransferCause::from_parts(&model.cause_kind, model.cause_ref)?,
        description: model.description,
        created_at: to_utc(model.created_at),
    })
}

pub(crate) fn cached_balance(model: balances::Model) -> Result<CachedBalance, LedgerError> {
    Ok(CachedBalance {
        balance: Balance {
            user_id: UserId(model.user_id),
            amount: money(model.amount, &model.currency, model.precision)?,
            last_transfer_id: model.last_transfer_id.map(TransferId),
            last_transfer_date: model.last_transfer_date.map(to_utc),
            last_transaction_id: model.last_transaction_id.map(TransactionId),
            last_transaction_date: model.last_transaction_date.map(to_utc),
        },
        updated_at: to_utc(model.updated_at),
    })
}

pub(crate) fn fine_group(model: user_fine_groups::Model) -> FineGroup {
    FineGroup {
        id: FineGroupId(model.id),
        user_id: UserId(model.user_id),
        waived_transfer_id: model.waived_transfer_id.map(TransferId),
        created_at: to_utc(model.created_at),
    }
}

pub(crate) fn fine(model: fines::Model) -> Result<Fine, LedgerError> {
    Ok(Fine {
        id: FineId(model.id),
        group_id: FineGroupId(model.user_fine_group_id),
        user_id: UserId(model.user_id),
        transfer_id: TransferId(model.transfer_id),
        amount: money(model.amount, &model.currency, model.precision)?,
        reference_balance: money(model.reference_balance, &model.currency, model.precision)?,
        created_at: to_utc(model.created_at),
    })
}

pub(crate) fn write_off(model: write_offs::Model) -> Result<WriteOff, LedgerError> {
    Ok(WriteOff {
        id: WriteOffId(model.id),
        user_id: UserId(model.user_id),
        transfer_id: TransferId(model.transfer_id),
        amount: money(model.amount, &model.currency, model.precision)?,
        created_at: to_utc(model.created_at),
    })
}

pub(crate) fn inactivity_cost(
    model: inactive_administrative_costs::Model,
) -> Result<InactivityCost, LedgerError> {
    Ok(InactivityCost {
        id: InactivityCostId(model.id),
        user_id: UserId(model.user_id),
        transfer_id: TransferId(model.transfer_id),
        amount: money(model.amount, &model.currency, model.precision)?,
        created_at: to_utc(model.created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stored_transfer(kind: &str, reference: Option<i64>) -> transfers::Model {
        transfers::Model {
            id: 42,
            from_user_id: None,
            to_user_id: Some(7),
            amount: 3900,
            currency: "EUR".into(),
            precision: 2,
            description: None,
            cause_kind: kind.into(),
            cause_ref: reference,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap().fixed_offset(),
        }
    }

    #[test]
    fn test_transfer_from_row() {
        let transfer = transfer(stored_transfer("deposit", Some(12))).unwrap();
        assert_eq!(transfer.id, TransferId(42));
        assert_eq!(transfer.to, Some(UserId(7)));
        assert_eq!(transfer.amount, Money::new(3900, Currency::Eur, 2));
        assert_eq!(transfer.cause, TransferCause::Deposit(12));
    }

    #[test]
    fn test_corrupt_rows_are_reported() {
        assert!(matches!(
            transfer(stored_transfer("deposit", None)),
            Err(LedgerError::CorruptRow(_))
        ));
        assert!(matches!(
            transfer(stored_transfer("gift", None)),
            Err(LedgerError::CorruptRow(_))
        ));
        assert!(matches!(money(1, "XXX", 2), Err(LedgerError::CorruptRow(_))));
        assert!(matches!(money(1, "EUR", -1), Err(LedgerError::CorruptRow(_))));
    }
}
