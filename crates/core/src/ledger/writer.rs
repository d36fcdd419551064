//! Ledger writes.
//!
//! Every balance-changing event enters the ledger through [`LedgerWriter`].
//! A write validates its input, locks the affected users in ascending id
//! order, appends the event, refreshes the cache rows of all affected users
//! and commits, all in one transaction. Concurrency conflicts are retried
//! with a fresh transaction.

use tabkeeper_shared::types::{Money, UserId};
use tracing::{info, instrument};

use super::balance::Balance;
use super::cache::BalanceCache;
use super::error::LedgerError;
use super::event::{Checkout, NewCheckout, NewTransfer, Transfer, TransferCause};
use super::retry::with_retry;
use crate::store::{LedgerStore, LedgerTx, lock_users};

/// A committed transfer and the balances it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedTransfer {
    /// The stored transfer.
    pub transfer: Transfer,
    /// Refreshed balances of every party, ascending by user id.
    pub balances: Vec<Balance>,
}

impl PostedTransfer {
    /// Balance of one party after the transfer.
    #[must_use]
    pub fn balance_of(&self, user_id: UserId) -> Option<&Balance> {
        self.balances.iter().find(|b| b.user_id == user_id)
    }
}

/// A committed checkout and the balances it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedCheckout {
    /// The stored checkout.
    pub checkout: Checkout,
    /// Refreshed balances of payer and sellers, ascending by user id.
    pub balances: Vec<Balance>,
}

/// Single entry point for balance-changing events.
#[derive(Debug)]
pub struct LedgerWriter<S> {
    cache: BalanceCache<S>,
}

impl<S> Clone for LedgerWriter<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<S: LedgerStore> LedgerWriter<S> {
    /// Creates a writer that keeps `cache` up to date.
    #[must_use]
    pub const fn new(cache: BalanceCache<S>) -> Self {
        Self { cache }
    }

    /// Records money paid in by a user.
    pub async fn record_deposit(
        &self,
        user_id: UserId,
        amount: Money,
        deposit_id: i64,
    ) -> Result<PostedTransfer, LedgerError> {
        self.record_transfer(NewTransfer::credit(
            user_id,
            amount,
            TransferCause::Deposit(deposit_id),
        ))
        .await
    }

    /// Records an invoice a user submitted; the user is credited.
    pub async fn record_invoice(
        &self,
        user_id: UserId,
        amount: Money,
        invoice_id: i64,
    ) -> Result<PostedTransfer, LedgerError> {
        self.record_transfer(NewTransfer::credit(
            user_id,
            amount,
            TransferCause::Invoice(invoice_id),
        ))
        .await
    }

    /// Records money paid out to a user.
    pub async fn record_payout(
        &self,
        user_id: UserId,
        amount: Money,
        payout_id: i64,
    ) -> Result<PostedTransfer, LedgerError> {
        self.record_transfer(NewTransfer::debit(
            user_id,
            amount,
            TransferCause::Payout(payout_id),
        ))
        .await
    }

    /// Reverses an invoice with an opposite transfer of the same amount.
    #[instrument(skip(self))]
    pub async fn void_invoice(&self, invoice_id: i64) -> Result<PostedTransfer, LedgerError> {
        with_retry(self.cache.ledger().max_attempts, "void_invoice", move || async move {
            let mut tx = self.cache.begin().await?;
            let original = tx
                .find_transfers_by_cause(TransferCause::Invoice(invoice_id))
                .await?
                .into_iter()
                .next()
                .ok_or(LedgerError::InvoiceNotFound(invoice_id))?;
            lock_users(&mut tx, &original.parties()).await?;

            let voids = tx
                .find_transfers_by_cause(TransferCause::InvoiceVoid(invoice_id))
                .await?;
            if !voids.is_empty() {
                return Err(LedgerError::InvoiceAlreadyVoided(invoice_id));
            }

            let reversal = NewTransfer {
                from: original.to,
                to: original.from,
                amount: original.amount,
                description: Some(format!("Void of invoice {invoice_id}")),
                cause: TransferCause::InvoiceVoid(invoice_id),
            };
            let posted = self.post_in(&mut tx, &reversal).await?;
            tx.commit().await?;
            Ok(posted)
        })
        .await
    }

    /// Records a transfer.
    ///
    /// Fines, waivers, write-offs and inactivity costs are rejected with
    /// [`LedgerError::ReservedCause`]; their engines record them together
    /// with the rows that explain them.
    #[instrument(skip(self, transfer), fields(cause = transfer.cause.kind()))]
    pub async fn record_transfer(
        &self,
        transfer: NewTransfer,
    ) -> Result<PostedTransfer, LedgerError> {
        if transfer.cause.is_reserved() {
            return Err(LedgerError::ReservedCause(transfer.cause.kind()));
        }
        self.validate_transfer(&transfer)?;

        let transfer = &transfer;
        with_retry(self.cache.ledger().max_attempts, transfer.cause.kind(), move || async move {
            let mut tx = self.cache.begin().await?;
            let posted = self.post_in(&mut tx, transfer).await?;
            tx.commit().await?;
            Ok(posted)
        })
        .await
    }

    /// Records a checkout: the payer is debited every row, each seller is
    /// credited their rows.
    #[instrument(skip(self, checkout), fields(payer = %checkout.payer))]
    pub async fn record_checkout(
        &self,
        checkout: NewCheckout,
    ) -> Result<PostedCheckout, LedgerError> {
        self.validate_checkout(&checkout)?;

        let checkout = &checkout;
        with_retry(self.cache.ledger().max_attempts, "checkout", move || async move {
            let mut tx = self.cache.begin().await?;
            let parties = checkout.parties();
            lock_users(&mut tx, &parties).await?;
            ensure_users_exist(&mut tx, &parties).await?;

            let stored = tx.insert_checkout(checkout, self.cache.clock().now()).await?;
            let mut balances = Vec::with_capacity(parties.len());
            for user_id in &parties {
                balances.push(self.cache.refresh_in(&mut tx, *user_id).await?);
            }
            tx.commit().await?;

            info!(transaction_id = %stored.id, rows = stored.rows.len(), "Checkout recorded");
            Ok(PostedCheckout {
                checkout: stored,
                balances,
            })
        })
        .await
    }

    /// Appends a validated transfer inside `tx` and refreshes the cache rows
    /// of its parties. The caller commits.
    pub async fn post_in(
        &self,
        tx: &mut S::Tx,
        transfer: &NewTransfer,
    ) -> Result<PostedTransfer, LedgerError> {
        let parties = transfer.parties();
        lock_users(tx, &parties).await?;
        ensure_users_exist(tx, &parties).await?;

        let stored = tx.insert_transfer(transfer, self.cache.clock().now()).await?;
        let mut balances = Vec::with_capacity(parties.len());
        for user_id in &parties {
            balances.push(self.cache.refresh_in(tx, *user_id).await?);
        }

        info!(
            transfer_id = %stored.id,
            cause = stored.cause.kind(),
            amount = %stored.amount,
            "Transfer recorded"
        );
        Ok(PostedTransfer {
            transfer: stored,
            balances,
        })
    }

    /// Checks the amount and parties of a transfer before it is written.
    pub fn validate_transfer(&self, transfer: &NewTransfer) -> Result<(), LedgerError> {
        self.validate_amount(transfer.amount)?;
        match (transfer.from, transfer.to) {
            (None, None) => Err(LedgerError::MissingParty),
            (Some(from), Some(to)) if from == to => Err(LedgerError::SelfTransfer(from)),
            _ => Ok(()),
        }
    }

    /// Checks a checkout before it is written.
    pub fn validate_checkout(&self, checkout: &NewCheckout) -> Result<(), LedgerError> {
        if checkout.rows().next().is_none() {
            return Err(LedgerError::EmptyCheckout);
        }
        let zero = self.cache.ledger().zero();
        for row in checkout.rows() {
            if row.quantity <= 0 {
                return Err(LedgerError::InvalidQuantity(row.quantity));
            }
            zero.checked_add(row.unit_price)
                .map_err(LedgerError::invalid_amount)?;
            if row.unit_price.is_negative() {
                return Err(LedgerError::NegativePrice(row.unit_price));
            }
        }
        checkout.total(zero).map_err(LedgerError::invalid_amount)?;
        Ok(())
    }

    /// Checks that an amount is positive and in the ledger currency.
    pub fn validate_amount(&self, amount: Money) -> Result<(), LedgerError> {
        self.cache
            .ledger()
            .zero()
            .checked_add(amount)
            .map_err(LedgerError::invalid_amount)?;
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        Ok(())
    }

    /// The cache this writer maintains.
    #[must_use]
    pub const fn cache(&self) -> &BalanceCache<S> {
        &self.cache
    }
}

async fn ensure_users_exist<T: LedgerTx>(
    tx: &mut T,
    user_ids: &[UserId],
) -> Result<(), LedgerError> {
    for user_id in user_ids {
        if tx.find_user(*user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(*user_id));
        }
    }
    Ok(())
}
