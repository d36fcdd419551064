//! Persistence traits for the ledger.
//!
//! Every ledger operation runs inside one [`LedgerTx`]. A transaction is
//! committed explicitly; dropping it without [`LedgerTx::commit`] rolls it
//! back. Writers serialize per user through [`LedgerTx::lock_user`], which
//! holds until the transaction ends.
//!
//! The store is a plain data layer: it does not validate amounts or
//! currencies and never computes balances. That is the job of the services
//! in [`crate::ledger`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabkeeper_shared::types::{FineGroupId, Money, PageRequest, TransferId, UserId};

use crate::fines::types::{Fine, FineGroup, NewFine, WriteOff};
use crate::inactivity::types::InactivityCost;
use crate::ledger::balance::{Balance, CachedBalance};
use crate::ledger::error::LedgerError;
use crate::ledger::event::{
    Checkout, EventRange, NewCheckout, NewTransfer, PurchaseRow, Transfer, TransferCause,
};

pub use memory::{InMemoryLedgerStore, InMemoryTx};

/// Ledger view of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUser {
    /// User ID.
    pub id: UserId,
    /// Whether the account is active.
    pub active: bool,
    /// Whether the inactivity cost has already been charged.
    pub inactive_notified: bool,
    /// Open fine group, if the user has unpaid fines.
    pub current_fine_group: Option<FineGroupId>,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

/// Which users a listing returns. Results are ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    /// Restrict to these users.
    pub user_ids: Option<Vec<UserId>>,
    /// Only active accounts.
    pub only_active: bool,
}

/// Entry point of a ledger store.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Transaction type of this store.
    type Tx: LedgerTx;

    /// Opens a transaction.
    async fn begin(&self) -> Result<Self::Tx, LedgerError>;
}

/// Operations available inside a ledger transaction.
#[async_trait]
pub trait LedgerTx: Send {
    /// Makes every change of the transaction durable.
    async fn commit(self) -> Result<(), LedgerError>;

    /// Discards every change of the transaction.
    async fn rollback(self) -> Result<(), LedgerError>;

    /// Takes the per-user write lock until the transaction ends.
    ///
    /// Callers locking several users must lock them in ascending id order.
    /// Taking a lock the transaction already holds is a no-op.
    async fn lock_user(&mut self, user_id: UserId) -> Result<(), LedgerError>;

    // ---------------------------------------------------------------- users

    /// Loads a user.
    async fn find_user(&mut self, user_id: UserId) -> Result<Option<LedgerUser>, LedgerError>;

    /// Lists user ids, with the total number of matches.
    ///
    /// `page = None` returns every match.
    async fn list_user_ids(
        &mut self,
        filter: &UserFilter,
        page: Option<&PageRequest>,
    ) -> Result<(Vec<UserId>, u64), LedgerError>;

    /// Sets the inactivity flag.
    async fn set_inactive_notified(
        &mut self,
        user_id: UserId,
        notified: bool,
    ) -> Result<(), LedgerError>;

    /// Points the user at an open fine group, or clears it.
    async fn set_current_fine_group(
        &mut self,
        user_id: UserId,
        group_id: Option<FineGroupId>,
    ) -> Result<(), LedgerError>;

    /// Latest of account creation, last transfer and last purchase.
    async fn last_activity_at(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, LedgerError>;

    /// Active users not yet charged whose last activity is before `before`.
    async fn inactivity_candidates(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<UserId>, LedgerError>;

    // ---------------------------------------------------------------- events

    /// Loads a transfer.
    async fn find_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, LedgerError>;

    /// Transfers recorded with the given cause, ascending by id.
    async fn find_transfers_by_cause(
        &mut self,
        cause: TransferCause,
    ) -> Result<Vec<Transfer>, LedgerError>;

    /// Transfers of a user inside `range`, ascending by id.
    async fn transfers_for(
        &mut self,
        user_id: UserId,
        range: &EventRange,
    ) -> Result<Vec<Transfer>, LedgerError>;

    /// Purchase rows of a user inside `range`, ascending by checkout then row.
    async fn purchases_for(
        &mut self,
        user_id: UserId,
        range: &EventRange,
    ) -> Result<Vec<PurchaseRow>, LedgerError>;

    /// Appends a transfer.
    async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
        created_at: DateTime<Utc>,
    ) -> Result<Transfer, LedgerError>;

    /// Appends a checkout with its sub transactions and rows.
    async fn insert_checkout(
        &mut self,
        checkout: &NewCheckout,
        created_at: DateTime<Utc>,
    ) -> Result<Checkout, LedgerError>;

    // ---------------------------------------------------------- balance cache

    /// Loads the cached balance of a user.
    async fn cached_balance(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<CachedBalance>, LedgerError>;

    /// Inserts or replaces the cached balance of a user.
    async fn store_balance(
        &mut self,
        balance: &Balance,
        updated_at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Deletes cached balances, all of them for `None`. Returns the number
    /// of rows removed.
    async fn delete_balances(&mut self, user_ids: Option<&[UserId]>) -> Result<u64, LedgerError>;

    // ----------------------------------------------------------------- fines

    /// Loads a fine group.
    async fn find_fine_group(
        &mut self,
        id: FineGroupId,
    ) -> Result<Option<FineGroup>, LedgerError>;

    /// Opens a fine group.
    async fn insert_fine_group(
        &mut self,
        user_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Result<FineGroup, LedgerError>;

    /// Records the transfer that waived a group.
    async fn set_fine_group_waived(
        &mut self,
        id: FineGroupId,
        transfer_id: TransferId,
    ) -> Result<(), LedgerError>;

    /// Fines of a group, ascending by id.
    async fn fines_in_group(&mut self, id: FineGroupId) -> Result<Vec<Fine>, LedgerError>;

    /// Records a fine.
    async fn insert_fine(
        &mut self,
        fine: &NewFine,
        created_at: DateTime<Utc>,
    ) -> Result<Fine, LedgerError>;

    /// Records a write-off.
    async fn insert_write_off(
        &mut self,
        user_id: UserId,
        transfer_id: TransferId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Result<WriteOff, LedgerError>;

    // ------------------------------------------------------------ inactivity

    /// Records an inactivity cost.
    async fn insert_inactivity_cost(
        &mut self,
        user_id: UserId,
        transfer_id: TransferId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Result<InactivityCost, LedgerError>;
}

/// Locks every user in ascending id order.
pub async fn lock_users<T: LedgerTx>(
    tx: &mut T,
    user_ids: &[UserId],
) -> Result<(), LedgerError> {
    let mut sorted = user_ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    for user_id in sorted {
        tx.lock_user(user_id).await?;
    }
    Ok(())
}
