//! Balance queries.
//!
//! Reads combine the cache row with events newer than its watermarks and
//! never write the cache, so they take no locks. Historical reads with a
//! cutoff ignore the cache and rescan from zero.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabkeeper_shared::LedgerConfig;
use tabkeeper_shared::types::{PageRequest, PageResponse, UserId};
use tracing::instrument;

use super::balance::Balance;
use super::error::LedgerError;
use super::event::Cutoff;
use super::query::{current_balance, full_balance};
use crate::store::{LedgerStore, LedgerTx, UserFilter};

/// Which balances [`BalanceService::get_balances`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    /// Restrict to these users. Ids without an account yield zero.
    pub user_ids: Option<Vec<UserId>>,
    /// Only active accounts.
    #[serde(default)]
    pub only_active: bool,
    /// Only negative balances.
    #[serde(default)]
    pub only_negative: bool,
    /// Historical cutoff.
    pub cutoff: Option<Cutoff>,
}

/// Read side of the ledger.
#[derive(Debug)]
pub struct BalanceService<S> {
    store: Arc<S>,
    ledger: LedgerConfig,
}

impl<S> Clone for BalanceService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: self.ledger.clone(),
        }
    }
}

impl<S: LedgerStore> BalanceService<S> {
    /// Creates a service over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, ledger: LedgerConfig) -> Self {
        Self { store, ledger }
    }

    /// Current balance of a user. Unknown users have a zero balance.
    #[instrument(skip(self))]
    pub async fn get_balance(&self, user_id: UserId) -> Result<Balance, LedgerError> {
        let mut tx = self.store.begin().await?;
        let balance = current_balance(&mut tx, user_id, self.ledger.zero()).await?;
        tx.rollback().await?;
        Ok(balance)
    }

    /// Balance of a user as of a cutoff.
    #[instrument(skip(self))]
    pub async fn get_balance_at(
        &self,
        user_id: UserId,
        cutoff: Cutoff,
    ) -> Result<Balance, LedgerError> {
        let mut tx = self.store.begin().await?;
        let balance = full_balance(&mut tx, user_id, self.ledger.zero(), Some(cutoff)).await?;
        tx.rollback().await?;
        Ok(balance)
    }

    /// Balances of many users, ordered by user id.
    ///
    /// Every element equals what [`Self::get_balance`] (or
    /// [`Self::get_balance_at`] with the same cutoff) returns for that user.
    #[instrument(skip(self))]
    pub async fn get_balances(
        &self,
        filter: &BalanceFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<Balance>, LedgerError> {
        let mut tx = self.store.begin().await?;

        let response = if filter.only_negative {
            let (user_ids, _) = self.candidates(&mut tx, filter, None).await?;
            let mut negative = Vec::new();
            for user_id in user_ids {
                let balance = self.balance_in(&mut tx, user_id, filter.cutoff).await?;
                if balance.amount.is_negative() {
                    negative.push(balance);
                }
            }
            let total = u64::try_from(negative.len()).unwrap_or(u64::MAX);
            let data = negative
                .into_iter()
                .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
                .take(usize::try_from(page.limit()).unwrap_or(usize::MAX))
                .collect();
            PageResponse::new(data, page.page, page.per_page, total)
        } else {
            let (user_ids, total) = self.candidates(&mut tx, filter, Some(page)).await?;
            let mut data = Vec::with_capacity(user_ids.len());
            for user_id in user_ids {
                data.push(self.balance_in(&mut tx, user_id, filter.cutoff).await?);
            }
            PageResponse::new(data, page.page, page.per_page, total)
        };

        tx.rollback().await?;
        Ok(response)
    }

    async fn balance_in(
        &self,
        tx: &mut S::Tx,
        user_id: UserId,
        cutoff: Option<Cutoff>,
    ) -> Result<Balance, LedgerError> {
        match cutoff {
            None => current_balance(tx, user_id, self.ledger.zero()).await,
            Some(_) => full_balance(tx, user_id, self.ledger.zero(), cutoff).await,
        }
    }

    async fn candidates(
        &self,
        tx: &mut S::Tx,
        filter: &BalanceFilter,
        page: Option<&PageRequest>,
    ) -> Result<(Vec<UserId>, u64), LedgerError> {
        match &filter.user_ids {
            // Explicit ids are answered even without an account.
            Some(ids) if !filter.only_active => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                let total = u64::try_from(ids.len()).unwrap_or(u64::MAX);
                let ids = match page {
                    None => ids,
                    Some(page) => ids
                        .into_iter()
                        .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
                        .take(usize::try_from(page.limit()).unwrap_or(usize::MAX))
                        .collect(),
                };
                Ok((ids, total))
            }
            _ => {
                let user_filter = UserFilter {
                    user_ids: filter.user_ids.clone(),
                    only_active: filter.only_active,
                };
                tx.list_user_ids(&user_filter, page).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::{NewTransfer, TransferCause};
    use crate::store::InMemoryLedgerStore;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use tabkeeper_shared::types::{Money, TransferId};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap()
    }

    fn money(amount: i64) -> Money {
        LedgerConfig::default().money(amount)
    }

    async fn post(
        store: &InMemoryLedgerStore,
        transfer: NewTransfer,
        at: DateTime<Utc>,
    ) -> TransferId {
        let mut tx = store.begin().await.unwrap();
        let stored = tx.insert_transfer(&transfer, at).await.unwrap();
        tx.commit().await.unwrap();
        stored.id
    }

    async fn seeded() -> (
        Arc<InMemoryLedgerStore>,
        BalanceService<InMemoryLedgerStore>,
        Vec<UserId>,
    ) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let mut users = Vec::new();
        for _ in 0..4 {
            users.push(store.create_user(start()).await);
        }
        let seed = [
            NewTransfer::credit(users[0], money(500), TransferCause::Deposit(1)),
            NewTransfer::debit(users[1], money(300), TransferCause::Payout(1)),
            NewTransfer::debit(users[2], money(50), TransferCause::Payout(2)),
        ];
        for transfer in seed {
            post(&store, transfer, start()).await;
        }
        let service = BalanceService::new(Arc::clone(&store), LedgerConfig::default());
        (store, service, users)
    }

    #[tokio::test]
    async fn test_unknown_user_has_zero_balance() {
        let (_, service, _) = seeded().await;
        let balance = service.get_balance(UserId(12_345)).await.unwrap();
        assert_eq!(balance.amount, money(0));
        assert_eq!(balance.last_transfer_id, None);
    }

    #[tokio::test]
    async fn test_batch_equals_single() {
        let (_, service, users) = seeded().await;
        let page = service
            .get_balances(&BalanceFilter::default(), &PageRequest::new(1, 10))
            .await
            .unwrap();

        assert_eq!(page.meta.total, 4);
        for balance in &page.data {
            assert_eq!(balance, &service.get_balance(balance.user_id).await.unwrap());
        }
        assert_eq!(page.data[0].user_id, users[0]);
    }

    #[tokio::test]
    async fn test_batch_with_explicit_ids_includes_unknown_users() {
        let (_, service, users) = seeded().await;
        let filter = BalanceFilter {
            user_ids: Some(vec![UserId(9_999), users[1]]),
            ..BalanceFilter::default()
        };
        let page = service
            .get_balances(&filter, &PageRequest::default())
            .await
            .unwrap();

        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].amount, money(-300));
        assert_eq!(page.data[1].user_id, UserId(9_999));
        assert_eq!(page.data[1].amount, money(0));
    }

    #[tokio::test]
    async fn test_only_negative_filters_before_paging() {
        let (_, service, users) = seeded().await;
        let filter = BalanceFilter {
            only_negative: true,
            ..BalanceFilter::default()
        };

        let first = service.get_balances(&filter, &PageRequest::new(1, 1)).await.unwrap();
        assert_eq!(first.meta.total, 2);
        assert_eq!(first.meta.total_pages, 2);
        assert_eq!(first.data[0].user_id, users[1]);

        let second = service.get_balances(&filter, &PageRequest::new(2, 1)).await.unwrap();
        assert_eq!(second.data[0].user_id, users[2]);
        assert_eq!(second.data[0].amount, money(-50));
    }

    #[tokio::test]
    async fn test_cutoff_by_transfer_and_by_date() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let user = store.create_user(start()).await;
        let first = post(
            &store,
            NewTransfer::credit(user, money(1000), TransferCause::Deposit(1)),
            start(),
        )
        .await;
        post(
            &store,
            NewTransfer::debit(user, money(400), TransferCause::Payout(1)),
            start() + TimeDelta::days(2),
        )
        .await;
        let service = BalanceService::new(Arc::clone(&store), LedgerConfig::default());

        let at_first = service.get_balance_at(user, Cutoff::Transfer(first)).await.unwrap();
        assert_eq!(at_first.amount, money(1000));
        assert_eq!(at_first.last_transfer_id, Some(first));

        let next_day = service
            .get_balance_at(user, Cutoff::Date(start() + TimeDelta::days(1)))
            .await
            .unwrap();
        assert_eq!(next_day.amount, money(1000));

        assert_eq!(service.get_balance(user).await.unwrap().amount, money(600));

        let missing = service.get_balance_at(user, Cutoff::Transfer(TransferId(77))).await;
        assert!(matches!(missing, Err(LedgerError::TransferNotFound(_))));
    }
}
