//! Materialized per-user balances.
//!
//! A cache row stores a balance together with the watermarks of the events
//! it covers. Reads never write the cache; every path that writes it holds
//! the user's lock and recomputes from the row it replaces, so a stale
//! cache row can be slow to read but never wrong.

use std::sync::Arc;

use tabkeeper_shared::LedgerConfig;
use tabkeeper_shared::types::UserId;
use tracing::{debug, info, instrument};

use super::balance::{Balance, CachedBalance};
use super::error::LedgerError;
use super::query::{current_balance, full_balance};
use crate::clock::Clock;
use crate::store::{LedgerStore, LedgerTx};

/// Balance cache over a ledger store.
#[derive(Debug)]
pub struct BalanceCache<S> {
    store: Arc<S>,
    ledger: LedgerConfig,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for BalanceCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: self.ledger.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: LedgerStore> BalanceCache<S> {
    /// Creates a cache over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, ledger: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// Opens a transaction on the underlying store.
    pub async fn begin(&self) -> Result<S::Tx, LedgerError> {
        self.store.begin().await
    }

    /// Reads the cache row of a user without touching it.
    pub async fn get(&self, user_id: UserId) -> Result<Option<CachedBalance>, LedgerError> {
        let mut tx = self.store.begin().await?;
        let cached = tx.cached_balance(user_id).await?;
        tx.rollback().await?;
        Ok(cached)
    }

    /// Recomputes a user's cache row from the complete history.
    #[instrument(skip(self))]
    pub async fn recompute(&self, user_id: UserId) -> Result<Balance, LedgerError> {
        let mut tx = self.store.begin().await?;
        tx.lock_user(user_id).await?;
        let balance = full_balance(&mut tx, user_id, self.ledger.zero(), None).await?;
        tx.store_balance(&balance, self.clock.now()).await?;
        tx.commit().await?;

        debug!(amount = %balance.amount, "Balance recomputed");
        Ok(balance)
    }

    /// Recomputes the cache rows of several users, one transaction each.
    pub async fn recompute_many(&self, user_ids: &[UserId]) -> Result<Vec<Balance>, LedgerError> {
        let mut balances = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            balances.push(self.recompute(*user_id).await?);
        }
        Ok(balances)
    }

    /// Drops the cache rows of the given users. The next write or read
    /// falls back to a full rescan for them.
    #[instrument(skip(self), fields(count = user_ids.len()))]
    pub async fn invalidate(&self, user_ids: &[UserId]) -> Result<u64, LedgerError> {
        let mut tx = self.store.begin().await?;
        let removed = tx.delete_balances(Some(user_ids)).await?;
        tx.commit().await?;
        info!(removed, "Balance cache invalidated");
        Ok(removed)
    }

    /// Drops every cache row.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<u64, LedgerError> {
        let mut tx = self.store.begin().await?;
        let removed = tx.delete_balances(None).await?;
        tx.commit().await?;
        info!(removed, "Balance cache cleared");
        Ok(removed)
    }

    /// Brings the user's cache row up to date inside `tx` and returns it.
    ///
    /// Takes the user's lock before reading, so the row cannot be replaced
    /// by a concurrent writer between read and write.
    pub async fn refresh_in(
        &self,
        tx: &mut S::Tx,
        user_id: UserId,
    ) -> Result<Balance, LedgerError> {
        tx.lock_user(user_id).await?;
        let balance = current_balance(tx, user_id, self.ledger.zero()).await?;
        tx.store_balance(&balance, self.clock.now()).await?;
        Ok(balance)
    }

    /// Ledger settings the cache computes with.
    #[must_use]
    pub const fn ledger(&self) -> &LedgerConfig {
        &self.ledger
    }

    /// The clock stamped on cache rows.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::event::{NewTransfer, TransferCause};
    use crate::store::InMemoryLedgerStore;
    use chrono::{DateTime, TimeZone, Utc};
    use tabkeeper_shared::types::TransferId;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemoryLedgerStore>, BalanceCache<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let cache = BalanceCache::new(
            Arc::clone(&store),
            LedgerConfig::default(),
            Arc::new(ManualClock::new(start())),
        );
        (store, cache)
    }

    async fn deposit(store: &InMemoryLedgerStore, user: UserId, amount: i64) -> TransferId {
        let ledger = LedgerConfig::default();
        let mut tx = store.begin().await.unwrap();
        let transfer = tx
            .insert_transfer(
                &NewTransfer::credit(user, ledger.money(amount), TransferCause::Deposit(amount)),
                start(),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        transfer.id
    }

    #[tokio::test]
    async fn test_refresh_is_incremental_and_idempotent() {
        let (store, cache) = setup();
        let user = store.create_user(start()).await;
        deposit(&store, user, 1000).await;

        let first = cache.recompute(user).await.unwrap();
        assert_eq!(first.amount.amount, 1000);

        let last = deposit(&store, user, 250).await;
        let mut tx = store.begin().await.unwrap();
        let refreshed = cache.refresh_in(&mut tx, user).await.unwrap();
        let again = cache.refresh_in(&mut tx, user).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(refreshed.amount.amount, 1250);
        assert_eq!(refreshed.last_transfer_id, Some(last));
        assert_eq!(again, refreshed);
        assert_eq!(cache.get(user).await.unwrap().unwrap().balance, refreshed);
    }

    #[tokio::test]
    async fn test_recompute_matches_incremental() {
        let (store, cache) = setup();
        let user = store.create_user(start()).await;
        for amount in [100, 200, 300] {
            deposit(&store, user, amount).await;
            let mut tx = store.begin().await.unwrap();
            cache.refresh_in(&mut tx, user).await.unwrap();
            tx.commit().await.unwrap();
        }

        let incremental = cache.get(user).await.unwrap().unwrap().balance;
        let full = cache.recompute(user).await.unwrap();
        assert_eq!(incremental, full);
        assert_eq!(cache.recompute(user).await.unwrap(), full);
    }

    #[tokio::test]
    async fn test_invalidate_falls_back_to_full_rescan() {
        let (store, cache) = setup();
        let user = store.create_user(start()).await;
        deposit(&store, user, 700).await;
        cache.recompute(user).await.unwrap();

        assert_eq!(cache.invalidate(&[user]).await.unwrap(), 1);
        assert!(cache.get(user).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        let balance = cache.refresh_in(&mut tx, user).await.unwrap();
        assert_eq!(balance.amount.amount, 700);
    }

    #[tokio::test]
    async fn test_dangling_watermark_is_reported() {
        let (store, cache) = setup();
        let user = store.create_user(start()).await;

        let mut tx = store.begin().await.unwrap();
        let mut broken = Balance::zero(user, LedgerConfig::default().zero());
        broken.last_transfer_id = Some(TransferId(404));
        tx.store_balance(&broken, start()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = cache.refresh_in(&mut tx, user).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::DanglingCacheWatermark { transfer_id, .. }
                if transfer_id == TransferId(404)
        ));
    }
}
