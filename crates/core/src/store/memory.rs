//! In-memory ledger store.
//!
//! A transaction takes the store-wide lock, works on a private copy of the
//! state and writes it back on commit. Transactions are therefore fully
//! serialized, which makes [`LedgerTx::lock_user`] a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tabkeeper_shared::types::{
    FineGroupId, FineId, InactivityCostId, Money, PageRequest, SubTransactionId,
    SubTransactionRowId, TransactionId, TransferId, UserId, WriteOffId,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerStore, LedgerTx, LedgerUser, UserFilter};
use crate::fines::types::{Fine, FineGroup, NewFine, WriteOff};
use crate::inactivity::types::InactivityCost;
use crate::ledger::balance::{Balance, CachedBalance};
use crate::ledger::error::LedgerError;
use crate::ledger::event::{
    Checkout, EventRange, NewCheckout, NewTransfer, PurchaseRow, Transfer, TransferCause,
};

#[derive(Debug, Clone, Default)]
struct Sequences {
    user: i64,
    transfer: i64,
    transaction: i64,
    sub_transaction: i64,
    row: i64,
    fine_group: i64,
    fine: i64,
    write_off: i64,
    inactivity_cost: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    seq: Sequences,
    users: BTreeMap<UserId, LedgerUser>,
    transfers: Vec<Transfer>,
    purchases: Vec<PurchaseRow>,
    balances: BTreeMap<UserId, CachedBalance>,
    fine_groups: BTreeMap<FineGroupId, FineGroup>,
    fines: Vec<Fine>,
    write_offs: Vec<WriteOff>,
    inactivity_costs: Vec<InactivityCost>,
}

impl MemoryState {
    fn user_mut(&mut self, user_id: UserId) -> Result<&mut LedgerUser, LedgerError> {
        self.users
            .get_mut(&user_id)
            .ok_or(LedgerError::UserNotFound(user_id))
    }
}

/// Ledger store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an active user account.
    pub async fn create_user(&self, created_at: DateTime<Utc>) -> UserId {
        let mut state = self.state.lock().await;
        let id = UserId(next(&mut state.seq.user));
        state.users.insert(
            id,
            LedgerUser {
                id,
                active: true,
                inactive_notified: false,
                current_fine_group: None,
                created_at,
            },
        );
        id
    }

    /// Activates or deactivates a user account.
    pub async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.user_mut(user_id)?.active = active;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx { guard, working })
    }
}

/// Transaction over an [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

fn page_bounds(page: Option<&PageRequest>, len: usize) -> (usize, usize) {
    match page {
        None => (0, len),
        Some(page) => {
            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX).min(len);
            let limit = usize::try_from(page.limit()).unwrap_or(usize::MAX);
            (offset, offset.saturating_add(limit).min(len))
        }
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn commit(mut self) -> Result<(), LedgerError> {
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn lock_user(&mut self, _user_id: UserId) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn find_user(&mut self, user_id: UserId) -> Result<Option<LedgerUser>, LedgerError> {
        Ok(self.working.users.get(&user_id).cloned())
    }

    async fn list_user_ids(
        &mut self,
        filter: &UserFilter,
        page: Option<&PageRequest>,
    ) -> Result<(Vec<UserId>, u64), LedgerError> {
        let matching: Vec<UserId> = self
            .working
            .users
            .values()
            .filter(|user| !filter.only_active || user.active)
            .filter(|user| {
                filter
                    .user_ids
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&user.id))
            })
            .map(|user| user.id)
            .collect();

        let total = u64::try_from(matching.len()).unwrap_or(u64::MAX);
        let (start, end) = page_bounds(page, matching.len());
        Ok((matching[start..end].to_vec(), total))
    }

    async fn set_inactive_notified(
        &mut self,
        user_id: UserId,
        notified: bool,
    ) -> Result<(), LedgerError> {
        self.working.user_mut(user_id)?.inactive_notified = notified;
        Ok(())
    }

    async fn set_current_fine_group(
        &mut self,
        user_id: UserId,
        group_id: Option<FineGroupId>,
    ) -> Result<(), LedgerError> {
        self.working.user_mut(user_id)?.current_fine_group = group_id;
        Ok(())
    }

    async fn last_activity_at(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let Some(user) = self.working.users.get(&user_id) else {
            return Ok(None);
        };
        let last_transfer = self
            .working
            .transfers
            .iter()
            .filter(|t| t.from == Some(user_id) || t.to == Some(user_id))
            .map(|t| t.created_at)
            .max();
        let last_purchase = self
            .working
            .purchases
            .iter()
            .filter(|row| row.payer == user_id || row.seller == user_id)
            .map(|row| row.created_at)
            .max();

        Ok([Some(user.created_at), last_transfer, last_purchase]
            .into_iter()
            .flatten()
            .max())
    }

    async fn inactivity_candidates(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<UserId>, LedgerError> {
        let pending: Vec<UserId> = self
            .working
            .users
            .values()
            .filter(|user| user.active && !user.inactive_notified)
            .map(|user| user.id)
            .collect();

        let mut candidates = Vec::new();
        for user_id in pending {
            if self
                .last_activity_at(user_id)
                .await?
                .is_some_and(|last| last < before)
            {
                candidates.push(user_id);
            }
        }
        Ok(candidates)
    }

    async fn find_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        Ok(self.working.transfers.iter().find(|t| t.id == id).cloned())
    }

    async fn find_transfers_by_cause(
        &mut self,
        cause: TransferCause,
    ) -> Result<Vec<Transfer>, LedgerError> {
        Ok(self
            .working
            .transfers
            .iter()
            .filter(|t| t.cause == cause)
            .cloned()
            .collect())
    }

    async fn transfers_for(
        &mut self,
        user_id: UserId,
        range: &EventRange,
    ) -> Result<Vec<Transfer>, LedgerError> {
        Ok(self
            .working
            .transfers
            .iter()
            .filter(|t| t.from == Some(user_id) || t.to == Some(user_id))
            .filter(|t| range.contains_transfer(t))
            .cloned()
            .collect())
    }

    async fn purchases_for(
        &mut self,
        user_id: UserId,
        range: &EventRange,
    ) -> Result<Vec<PurchaseRow>, LedgerError> {
        Ok(self
            .working
            .purchases
            .iter()
            .filter(|row| row.payer == user_id || row.seller == user_id)
            .filter(|row| range.contains_purchase(row))
            .cloned()
            .collect())
    }

    async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
        created_at: DateTime<Utc>,
    ) -> Result<Transfer, LedgerError> {
        let stored = Transfer {
            id: TransferId(next(&mut self.working.seq.transfer)),
            from: transfer.from,
            to: transfer.to,
            amount: transfer.amount,
            description: transfer.description.clone(),
            cause: transfer.cause,
            created_at,
        };
        self.working.transfers.push(stored.clone());
        Ok(stored)
    }

    async fn insert_checkout(
        &mut self,
        checkout: &NewCheckout,
        created_at: DateTime<Utc>,
    ) -> Result<Checkout, LedgerError> {
        let state = &mut self.working;
        let transaction_id = TransactionId(next(&mut state.seq.transaction));
        let mut rows = Vec::new();

        for sub in &checkout.sub_transactions {
            let sub_transaction_id = SubTransactionId(next(&mut state.seq.sub_transaction));
            for row in &sub.rows {
                rows.push(PurchaseRow {
                    id: SubTransactionRowId(next(&mut state.seq.row)),
                    transaction_id,
                    sub_transaction_id,
                    payer: checkout.payer,
                    seller: sub.seller,
                    product_id: row.product_id,
                    product_revision: row.product_revision,
                    quantity: row.quantity,
                    unit_price: row.unit_price,
                    created_at,
                });
            }
        }

        state.purchases.extend(rows.iter().cloned());
        Ok(Checkout {
            id: transaction_id,
            payer: checkout.payer,
            created_at,
            rows,
        })
    }

    async fn cached_balance(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<CachedBalance>, LedgerError> {
        Ok(self.working.balances.get(&user_id).cloned())
    }

    async fn store_balance(
        &mut self,
        balance: &Balance,
        updated_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.working.balances.insert(
            balance.user_id,
            CachedBalance {
                balance: balance.clone(),
                updated_at,
            },
        );
        Ok(())
    }

    async fn delete_balances(&mut self, user_ids: Option<&[UserId]>) -> Result<u64, LedgerError> {
        let before = self.working.balances.len();
        match user_ids {
            None => self.working.balances.clear(),
            Some(ids) => self.working.balances.retain(|id, _| !ids.contains(id)),
        }
        Ok(u64::try_from(before - self.working.balances.len()).unwrap_or(u64::MAX))
    }

    async fn find_fine_group(
        &mut self,
        id: FineGroupId,
    ) -> Result<Option<FineGroup>, LedgerError> {
        Ok(self.working.fine_groups.get(&id).cloned())
    }

    async fn insert_fine_group(
        &mut self,
        user_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Result<FineGroup, LedgerError> {
        let group = FineGroup {
            id: FineGroupId(next(&mut self.working.seq.fine_group)),
            user_id,
            waived_transfer_id: None,
            created_at,
        };
        self.working.fine_groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn set_fine_group_waived(
        &mut self,
        id: FineGroupId,
        transfer_id: TransferId,
    ) -> Result<(), LedgerError> {
        let group = self
            .working
            .fine_groups
            .get_mut(&id)
            .ok_or(LedgerError::FineGroupNotFound(id))?;
        group.waived_transfer_id = Some(transfer_id);
        Ok(())
    }

    async fn fines_in_group(&mut self, id: FineGroupId) -> Result<Vec<Fine>, LedgerError> {
        Ok(self
            .working
            .fines
            .iter()
            .filter(|fine| fine.group_id == id)
            .cloned()
            .collect())
    }

    async fn insert_fine(
        &mut self,
        fine: &NewFine,
        created_at: DateTime<Utc>,
    ) -> Result<Fine, LedgerError> {
        let stored = Fine {
            id: FineId(next(&mut self.working.seq.fine)),
            group_id: fine.group_id,
            user_id: fine.user_id,
            transfer_id: fine.transfer_id,
            amount: fine.amount,
            reference_balance: fine.reference_balance,
            created_at,
        };
        self.working.fines.push(stored.clone());
        Ok(stored)
    }

    async fn insert_write_off(
        &mut self,
        user_id: UserId,
        transfer_id: TransferId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Result<WriteOff, LedgerError> {
        let stored = WriteOff {
            id: WriteOffId(next(&mut self.working.seq.write_off)),
            user_id,
            transfer_id,
            amount,
            created_at,
        };
        self.working.write_offs.push(stored.clone());
        Ok(stored)
    }

    async fn insert_inactivity_cost(
        &mut self,
        user_id: UserId,
        transfer_id: TransferId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Result<InactivityCost, LedgerError> {
        let stored = InactivityCost {
            id: InactivityCostId(next(&mut self.working.seq.inactivity_cost)),
            user_id,
            transfer_id,
            amount,
            created_at,
        };
        self.working.inactivity_costs.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tabkeeper_shared::types::Currency;

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::Eur, 2)
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_commit_persists_and_drop_discards() {
        let store = InMemoryLedgerStore::new();
        let user = store.create_user(at(1)).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_transfer(
            &NewTransfer::credit(user, eur(100), TransferCause::Deposit(1)),
            at(2),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_transfer(
                &NewTransfer::credit(user, eur(999), TransferCause::Deposit(2)),
                at(3),
            )
            .await
            .unwrap();
            // dropped without commit
        }

        let mut tx = store.begin().await.unwrap();
        let transfers = tx.transfers_for(user, &EventRange::all()).await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, eur(100));
    }

    #[tokio::test]
    async fn test_list_user_ids_filters_and_pages() {
        let store = InMemoryLedgerStore::new();
        let mut ids = Vec::new();
        for day in 1..=5 {
            ids.push(store.create_user(at(day)).await);
        }
        store.set_user_active(ids[1], false).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let filter = UserFilter {
            user_ids: None,
            only_active: true,
        };
        let (page, total) = tx
            .list_user_ids(&filter, Some(&PageRequest::new(2, 2)))
            .await
            .unwrap();
        assert_eq!(total, 4);
        assert_eq!(page, vec![ids[3], ids[4]]);

        let filter = UserFilter {
            user_ids: Some(vec![ids[0], ids[1], UserId(999)]),
            only_active: false,
        };
        let (all, total) = tx.list_user_ids(&filter, None).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(all, vec![ids[0], ids[1]]);
    }

    #[tokio::test]
    async fn test_last_activity_and_candidates() {
        let store = InMemoryLedgerStore::new();
        let quiet = store.create_user(at(1)).await;
        let busy = store.create_user(at(1)).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_transfer(
            &NewTransfer::credit(busy, eur(100), TransferCause::Deposit(1)),
            at(20),
        )
        .await
        .unwrap();

        assert_eq!(tx.last_activity_at(quiet).await.unwrap(), Some(at(1)));
        assert_eq!(tx.last_activity_at(busy).await.unwrap(), Some(at(20)));
        assert_eq!(tx.last_activity_at(UserId(42)).await.unwrap(), None);
        assert_eq!(tx.inactivity_candidates(at(10)).await.unwrap(), vec![quiet]);

        tx.set_inactive_notified(quiet, true).await.unwrap();
        assert!(tx.inactivity_candidates(at(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_balances_counts_rows() {
        let store = InMemoryLedgerStore::new();
        let a = store.create_user(at(1)).await;
        let b = store.create_user(at(1)).await;

        let mut tx = store.begin().await.unwrap();
        tx.store_balance(&Balance::zero(a, eur(0)), at(2)).await.unwrap();
        tx.store_balance(&Balance::zero(b, eur(0)), at(2)).await.unwrap();

        assert_eq!(tx.delete_balances(Some(&[a])).await.unwrap(), 1);
        assert!(tx.cached_balance(a).await.unwrap().is_none());
        assert!(tx.cached_balance(b).await.unwrap().is_some());
        assert_eq!(tx.delete_balances(None).await.unwrap(), 1);
    }
}
