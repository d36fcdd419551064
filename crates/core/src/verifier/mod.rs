//! Balance snapshots around structural changes.
//!
//! A structural change rewrites stored events without meaning to move money,
//! for example re-pointing purchase rows at a merged product. The verifier
//! clears and rebuilds the cache rows of the affected users before and after
//! the change and refuses to commit when any balance differs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabkeeper_shared::types::{Money, UserId};
use tracing::{error, info, instrument};

use crate::ledger::{BalanceCache, LedgerError};
use crate::store::{LedgerStore, LedgerTx, lock_users};

/// A user whose balance changed across a structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMismatch {
    /// The user.
    pub user_id: UserId,
    /// Balance before the change.
    pub before: Money,
    /// Balance after the change.
    pub after: Money,
}

/// Balances of a set of users at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    balances: BTreeMap<UserId, Money>,
}

impl BalanceSnapshot {
    /// Balance of a user, if the snapshot covers them.
    #[must_use]
    pub fn get(&self, user_id: UserId) -> Option<Money> {
        self.balances.get(&user_id).copied()
    }

    /// Records a balance.
    pub fn insert(&mut self, user_id: UserId, amount: Money) {
        self.balances.insert(user_id, amount);
    }

    /// Balances ascending by user id.
    pub fn iter(&self) -> impl Iterator<Item = (UserId, Money)> + '_ {
        self.balances.iter().map(|(user_id, amount)| (*user_id, *amount))
    }

    /// Number of users covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.balances.len()
    }

    /// Returns true if the snapshot covers no user.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

impl FromIterator<(UserId, Money)> for BalanceSnapshot {
    fn from_iter<I: IntoIterator<Item = (UserId, Money)>>(iter: I) -> Self {
        Self {
            balances: iter.into_iter().collect(),
        }
    }
}

/// Users whose balance differs between two snapshots, ascending by id.
///
/// A user missing from one side is compared against `zero`.
#[must_use]
pub fn diff(
    before: &BalanceSnapshot,
    after: &BalanceSnapshot,
    zero: Money,
) -> Vec<BalanceMismatch> {
    let mut users: Vec<UserId> = before
        .balances
        .keys()
        .chain(after.balances.keys())
        .copied()
        .collect();
    users.sort_unstable();
    users.dedup();

    users
        .into_iter()
        .filter_map(|user_id| {
            let before = before.get(user_id).unwrap_or(zero);
            let after = after.get(user_id).unwrap_or(zero);
            (before != after).then_some(BalanceMismatch {
                user_id,
                before,
                after,
            })
        })
        .collect()
}

/// Fails with [`LedgerError::BalanceMismatch`] if the snapshots differ.
pub fn verify(
    before: &BalanceSnapshot,
    after: &BalanceSnapshot,
    zero: Money,
) -> Result<(), LedgerError> {
    let mismatches = diff(before, after, zero);
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(LedgerError::BalanceMismatch { mismatches })
    }
}

/// A rewrite of stored events that must leave every balance unchanged.
#[async_trait]
pub trait StructuralChange<T: LedgerTx>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Applies the change inside `tx`.
    async fn apply(&self, tx: &mut T) -> Result<(), LedgerError>;
}

/// Runs structural changes under balance verification.
#[derive(Debug)]
pub struct ConsistencyVerifier<S> {
    cache: BalanceCache<S>,
}

impl<S: LedgerStore> ConsistencyVerifier<S> {
    /// Creates a verifier over `cache`.
    #[must_use]
    pub const fn new(cache: BalanceCache<S>) -> Self {
        Self { cache }
    }

    /// Clears the cache rows of `users` and rebuilds them from the full
    /// history.
    #[instrument(skip(self), fields(count = user_ids.len()))]
    pub async fn snapshot(&self, user_ids: &[UserId]) -> Result<BalanceSnapshot, LedgerError> {
        let mut tx = self.cache.begin().await?;
        let snapshot = self.snapshot_in(&mut tx, user_ids).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    /// [`Self::snapshot`] inside a caller's transaction.
    pub async fn snapshot_in(
        &self,
        tx: &mut S::Tx,
        user_ids: &[UserId],
    ) -> Result<BalanceSnapshot, LedgerError> {
        lock_users(tx, user_ids).await?;
        tx.delete_balances(Some(user_ids)).await?;

        let mut snapshot = BalanceSnapshot::default();
        for user_id in user_ids {
            let balance = self.cache.refresh_in(tx, *user_id).await?;
            snapshot.insert(*user_id, balance.amount);
        }
        Ok(snapshot)
    }

    /// Snapshots `users`, applies `change`, snapshots again and commits only
    /// if no balance moved. On a mismatch the change is rolled back.
    #[instrument(skip(self, change), fields(change = change.name(), count = user_ids.len()))]
    pub async fn run_structural_change(
        &self,
        user_ids: &[UserId],
        change: &dyn StructuralChange<S::Tx>,
    ) -> Result<BalanceSnapshot, LedgerError> {
        let mut tx = self.cache.begin().await?;
        let before = self.snapshot_in(&mut tx, user_ids).await?;
        change.apply(&mut tx).await?;
        let after = self.snapshot_in(&mut tx, user_ids).await?;

        if let Err(err) = verify(&before, &after, self.cache.ledger().zero()) {
            tx.rollback().await?;
            error!(change = change.name(), error = %err, "Structural change rolled back");
            return Err(err);
        }

        tx.commit().await?;
        info!(change = change.name(), "Structural change verified");
        Ok(after)
    }
}
