//! Balance derivation inside a store transaction.

use tabkeeper_shared::types::{Money, UserId};

use super::balance::{Balance, DebtStreak, aggregate, debt_streak};
use super::error::LedgerError;
use super::event::{Cutoff, EventRange, PurchaseRow, Transfer};
use crate::store::LedgerTx;

/// Translates a cutoff into an event range.
pub async fn cutoff_range<T: LedgerTx>(
    tx: &mut T,
    cutoff: Option<Cutoff>,
) -> Result<EventRange, LedgerError> {
    match cutoff {
        None => Ok(EventRange::all()),
        Some(Cutoff::Date(date)) => Ok(EventRange {
            until_date: Some(date),
            ..EventRange::default()
        }),
        Some(Cutoff::Transfer(id)) => {
            let transfer = tx
                .find_transfer(id)
                .await?
                .ok_or(LedgerError::TransferNotFound(id))?;
            Ok(EventRange {
                until_transfer: Some(id),
                until_date: Some(transfer.created_at),
                ..EventRange::default()
            })
        }
    }
}

/// Aggregates every event of the user from zero, up to an optional cutoff.
pub async fn full_balance<T: LedgerTx>(
    tx: &mut T,
    user_id: UserId,
    zero: Money,
    cutoff: Option<Cutoff>,
) -> Result<Balance, LedgerError> {
    let range = cutoff_range(tx, cutoff).await?;
    let transfers = tx.transfers_for(user_id, &range).await?;
    let purchases = tx.purchases_for(user_id, &range).await?;
    aggregate(user_id, zero, None, &transfers, &purchases)
}

/// Folds the events after the seed's watermarks into the seed.
///
/// A seed that points at a transfer which no longer exists is a data
/// integrity violation, not a reason to fall back to a full rescan.
pub async fn incremental_balance<T: LedgerTx>(
    tx: &mut T,
    seed: Balance,
    zero: Money,
) -> Result<Balance, LedgerError> {
    if let Some(transfer_id) = seed.last_transfer_id
        && tx.find_transfer(transfer_id).await?.is_none()
    {
        return Err(LedgerError::DanglingCacheWatermark {
            user_id: seed.user_id,
            transfer_id,
        });
    }

    let user_id = seed.user_id;
    let range = EventRange::after(seed.last_transfer_id, seed.last_transaction_id);
    let transfers = tx.transfers_for(user_id, &range).await?;
    let purchases = tx.purchases_for(user_id, &range).await?;
    aggregate(user_id, zero, Some(seed), &transfers, &purchases)
}

/// Current balance: the cached value plus newer events, or a full rescan
/// when the user has no cache row.
pub async fn current_balance<T: LedgerTx>(
    tx: &mut T,
    user_id: UserId,
    zero: Money,
) -> Result<Balance, LedgerError> {
    match tx.cached_balance(user_id).await? {
        Some(cached) => incremental_balance(tx, cached.balance, zero).await,
        None => full_balance(tx, user_id, zero, None).await,
    }
}

/// Complete history of a user.
pub async fn history<T: LedgerTx>(
    tx: &mut T,
    user_id: UserId,
) -> Result<(Vec<Transfer>, Vec<PurchaseRow>), LedgerError> {
    let range = EventRange::all();
    let transfers = tx.transfers_for(user_id, &range).await?;
    let purchases = tx.purchases_for(user_id, &range).await?;
    Ok((transfers, purchases))
}

/// Walks the complete history and checks it against the current balance.
///
/// A mismatch means the cache row diverged from the events it claims to
/// cover.
pub async fn checked_debt_streak<T: LedgerTx>(
    tx: &mut T,
    current: &Balance,
    zero: Money,
) -> Result<DebtStreak, LedgerError> {
    let (transfers, purchases) = history(tx, current.user_id).await?;
    let streak = debt_streak(current.user_id, zero, &transfers, &purchases)?;
    if streak.balance != current.amount {
        return Err(LedgerError::CacheDivergence {
            user_id: current.user_id,
            cached: current.amount,
            actual: streak.balance,
        });
    }
    Ok(streak)
}
