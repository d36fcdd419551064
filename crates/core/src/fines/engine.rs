//! Fine engine.
//!
//! The scan evaluates every user in their own transaction:
//!
//! 1. Lock the user and bring their cache row up to date.
//! 2. Walk the full history to find when the current debt streak began,
//!    checking that the walk ends at the cached balance.
//! 3. If the streak has lasted longer than the threshold (counted from the
//!    last fine of the streak, if any), debit a fine and record it in the
//!    user's open fine group.
//!
//! A user whose balance is no longer negative gets their open fine group
//! closed. A failure for one user is recorded and the scan moves on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tabkeeper_shared::FineConfig;
use tabkeeper_shared::types::{FineGroupId, Money, UserId};
use tracing::{debug, info, instrument, warn};

use super::policy::FinePolicy;
use super::types::{DebtState, Fine, FineScanReport, IssuedFine, NewFine, WriteOff};
use crate::ledger::query::{checked_debt_streak, current_balance};
use crate::ledger::{
    LedgerError, LedgerWriter, NewTransfer, PostedTransfer, TransferCause, with_retry,
};
use crate::notify::{LedgerNotifier, NoopNotifier};
use crate::scan::{ScanFailure, SkipReason, finish};
use crate::store::{LedgerStore, LedgerTx, LedgerUser, UserFilter};

/// Fines of an open group that were waived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaivedFines {
    /// The waived group.
    pub group_id: FineGroupId,
    /// The waived fines.
    pub fines: Vec<Fine>,
    /// The crediting transfer.
    pub transfer: PostedTransfer,
}

/// A debt that was written off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenOff {
    /// The write-off record.
    pub write_off: WriteOff,
    /// The crediting transfer.
    pub transfer: PostedTransfer,
}

enum Evaluation {
    Fined(IssuedFine),
    Settled,
    Skipped(SkipReason),
}

/// Issues, waives and writes off fines.
pub struct FineEngine<S> {
    writer: LedgerWriter<S>,
    policy: FinePolicy,
    notifier: Arc<dyn LedgerNotifier>,
}

impl<S: LedgerStore> FineEngine<S> {
    /// Creates an engine that writes through `writer`.
    #[must_use]
    pub fn new(writer: LedgerWriter<S>, config: FineConfig) -> Self {
        Self {
            writer,
            policy: FinePolicy::new(config),
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Sets the notifier told about every committed fine.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn LedgerNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// The policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &FinePolicy {
        &self.policy
    }

    /// Scans every user and issues the fines that are due.
    ///
    /// With `dry_run`, each user's transaction is rolled back instead of
    /// committed and no notifications are sent; the report shows what a
    /// real run would have done.
    #[instrument(skip(self))]
    pub async fn run(&self, dry_run: bool) -> Result<FineScanReport, LedgerError> {
        let now = self.writer.cache().clock().now();
        let mut report = FineScanReport::new(now, dry_run);

        let user_ids = {
            let mut tx = self.writer.cache().begin().await?;
            let (ids, _) = tx.list_user_ids(&UserFilter::default(), None).await?;
            tx.rollback().await?;
            ids
        };

        for user_id in user_ids {
            report.examined += 1;
            match self.evaluate(user_id, now, dry_run).await {
                Ok(Evaluation::Fined(issued)) => {
                    if !dry_run {
                        self.notify(&issued, &mut report.warnings).await;
                    }
                    report.processed.push(issued);
                }
                Ok(Evaluation::Settled) => report.settled.push(user_id),
                Ok(Evaluation::Skipped(reason)) => report.skipped.push((user_id, reason)),
                Err(error) => {
                    warn!(%user_id, %error, "Fine evaluation failed");
                    report.failures.push(ScanFailure { user_id, error });
                }
            }
        }

        info!(
            examined = report.examined,
            fined = report.processed.len(),
            settled = report.settled.len(),
            failed = report.failures.len(),
            dry_run,
            "Fine scan finished"
        );
        Ok(report)
    }

    /// Where a user stands in the debt lifecycle.
    pub async fn debt_state(&self, user_id: UserId) -> Result<DebtState, LedgerError> {
        let zero = self.writer.cache().ledger().zero();
        let mut tx = self.writer.cache().begin().await?;
        let account = tx
            .find_user(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;

        let current = current_balance(&mut tx, user_id, zero).await?;
        let streak = checked_debt_streak(&mut tx, &current, zero).await?;
        let (_, fines) = open_group(&mut tx, &account, streak.since).await?;
        tx.rollback().await?;

        Ok(self
            .policy
            .state(&streak, u32::try_from(fines.len()).unwrap_or(u32::MAX)))
    }

    /// Issues a fine of a given amount by hand, regardless of the schedule.
    #[instrument(skip(self))]
    pub async fn hand_out(
        &self,
        user_id: UserId,
        amount: Money,
    ) -> Result<IssuedFine, LedgerError> {
        self.writer.validate_amount(amount)?;
        let zero = self.writer.cache().ledger().zero();

        let issued = with_retry(
            self.writer.cache().ledger().max_attempts,
            "hand_out_fine",
            move || async move {
                let mut tx = self.writer.cache().begin().await?;
                tx.lock_user(user_id).await?;
                let account = tx
                    .find_user(user_id)
                    .await?
                    .ok_or(LedgerError::UserNotFound(user_id))?;
                let current = self.writer.cache().refresh_in(&mut tx, user_id).await?;
                let streak = checked_debt_streak(&mut tx, &current, zero).await?;
                let (group_id, fines) = open_group(&mut tx, &account, streak.since).await?;

                let issued = self
                    .issue_in(&mut tx, user_id, group_id, current.amount, amount, fines.len())
                    .await?;
                tx.commit().await?;
                Ok(issued)
            },
        )
        .await?;

        let mut warnings = Vec::new();
        self.notify(&issued, &mut warnings).await;
        Ok(issued)
    }

    /// Cancels every fine of the user's open group with one crediting
    /// transfer and closes the group.
    #[instrument(skip(self))]
    pub async fn waive_fines(&self, user_id: UserId) -> Result<WaivedFines, LedgerError> {
        with_retry(
            self.writer.cache().ledger().max_attempts,
            "waive_fines",
            move || async move {
                let mut tx = self.writer.cache().begin().await?;
                tx.lock_user(user_id).await?;
                let account = tx
                    .find_user(user_id)
                    .await?
                    .ok_or(LedgerError::UserNotFound(user_id))?;
                let group_id = account
                    .current_fine_group
                    .ok_or(LedgerError::NoOpenFines(user_id))?;
                let fines = tx.fines_in_group(group_id).await?;
                let Some(first) = fines.first() else {
                    return Err(LedgerError::NoOpenFines(user_id));
                };

                let total = fines
                    .iter()
                    .skip(1)
                    .fold(first.amount, |sum, fine| sum + fine.amount);
                let credit = NewTransfer::credit(user_id, total, TransferCause::FineWaiver)
                    .with_description(format!("Waiver of {} fine(s)", fines.len()));
                self.writer.validate_transfer(&credit)?;
                let transfer = self.writer.post_in(&mut tx, &credit).await?;

                tx.set_fine_group_waived(group_id, transfer.transfer.id).await?;
                tx.set_current_fine_group(user_id, None).await?;
                tx.commit().await?;

                info!(%user_id, %group_id, amount = %total, "Fines waived");
                Ok(WaivedFines {
                    group_id,
                    fines,
                    transfer,
                })
            },
        )
        .await
    }

    /// Writes off the negative balance of a user: credits the full debt and
    /// closes the open fine group.
    #[instrument(skip(self))]
    pub async fn write_off(&self, user_id: UserId) -> Result<WrittenOff, LedgerError> {
        with_retry(
            self.writer.cache().ledger().max_attempts,
            "write_off",
            move || async move {
                let mut tx = self.writer.cache().begin().await?;
                tx.lock_user(user_id).await?;
                let account = tx
                    .find_user(user_id)
                    .await?
                    .ok_or(LedgerError::UserNotFound(user_id))?;
                let current = self.writer.cache().refresh_in(&mut tx, user_id).await?;
                if !current.amount.is_negative() {
                    return Err(LedgerError::NotInDebt {
                        user_id,
                        balance: current.amount,
                    });
                }

                let amount = current.amount.negate();
                let credit = NewTransfer::credit(user_id, amount, TransferCause::WriteOff)
                    .with_description("Write-off of unrecoverable debt");
                let transfer = self.writer.post_in(&mut tx, &credit).await?;
                let write_off = tx
                    .insert_write_off(
                        user_id,
                        transfer.transfer.id,
                        amount,
                        transfer.transfer.created_at,
                    )
                    .await?;
                if account.current_fine_group.is_some() {
                    tx.set_current_fine_group(user_id, None).await?;
                }
                tx.commit().await?;

                info!(%user_id, %amount, "Debt written off");
                Ok(WrittenOff {
                    write_off,
                    transfer,
                })
            },
        )
        .await
    }

    async fn evaluate(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Evaluation, LedgerError> {
        let zero = self.writer.cache().ledger().zero();
        let mut tx = self.writer.cache().begin().await?;
        tx.lock_user(user_id).await?;
        let account = tx
            .find_user(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;
        let current = self.writer.cache().refresh_in(&mut tx, user_id).await?;
        let streak = checked_debt_streak(&mut tx, &current, zero).await?;

        let Some(since) = streak.since else {
            let evaluation = if account.current_fine_group.is_some() {
                tx.set_current_fine_group(user_id, None).await?;
                debug!(%user_id, "Debt settled, fine group closed");
                Evaluation::Settled
            } else {
                Evaluation::Skipped(SkipReason::NotInDebt)
            };
            finish(tx, dry_run).await?;
            return Ok(evaluation);
        };

        let (group_id, fines) = open_group(&mut tx, &account, Some(since)).await?;
        let last_fine_at = fines.iter().map(|fine| fine.created_at).max();
        if !self.policy.is_due(since, last_fine_at, now) {
            finish(tx, dry_run).await?;
            return Ok(Evaluation::Skipped(SkipReason::NotDue));
        }

        let amount = self.policy.fine_for(current.amount);
        if amount.is_zero() {
            finish(tx, dry_run).await?;
            return Ok(Evaluation::Skipped(SkipReason::ZeroAmount));
        }

        let issued = self
            .issue_in(&mut tx, user_id, group_id, current.amount, amount, fines.len())
            .await?;
        finish(tx, dry_run).await?;
        Ok(Evaluation::Fined(issued))
    }

    async fn issue_in(
        &self,
        tx: &mut S::Tx,
        user_id: UserId,
        group_id: Option<FineGroupId>,
        reference_balance: Money,
        amount: Money,
        previous_fines: usize,
    ) -> Result<IssuedFine, LedgerError> {
        let debit = NewTransfer::debit(user_id, amount, TransferCause::Fine)
            .with_description(format!("Fine for a balance of {reference_balance}"));
        self.writer.validate_transfer(&debit)?;
        let posted = self.writer.post_in(tx, &debit).await?;

        let group_id = match group_id {
            Some(id) => id,
            None => {
                let group = tx
                    .insert_fine_group(user_id, posted.transfer.created_at)
                    .await?;
                tx.set_current_fine_group(user_id, Some(group.id)).await?;
                group.id
            }
        };

        let fine = tx
            .insert_fine(
                &NewFine {
                    group_id,
                    user_id,
                    transfer_id: posted.transfer.id,
                    amount,
                    reference_balance,
                },
                posted.transfer.created_at,
            )
            .await?;

        let balance_after = posted
            .balance_of(user_id)
            .map_or(reference_balance - amount, |balance| balance.amount);
        info!(%user_id, fine_id = %fine.id, %amount, %balance_after, "Fine issued");

        Ok(IssuedFine {
            fine,
            balance_after,
            fine_count: u32::try_from(previous_fines + 1).unwrap_or(u32::MAX),
        })
    }

    async fn notify(&self, issued: &IssuedFine, warnings: &mut Vec<String>) {
        if let Err(error) = self.notifier.fine_issued(issued).await {
            warn!(user_id = %issued.fine.user_id, %error, "Fine notification failed");
            warnings.push(format!(
                "notification for fine {} failed: {error}",
                issued.fine.id
            ));
        }
    }
}

/// The user's open fine group, if it belongs to the current debt streak.
///
/// A group opened before the streak began is left over from an earlier
/// streak and does not count.
async fn open_group<T: LedgerTx>(
    tx: &mut T,
    account: &LedgerUser,
    since: Option<DateTime<Utc>>,
) -> Result<(Option<FineGroupId>, Vec<Fine>), LedgerError> {
    let (Some(group_id), Some(since)) = (account.current_fine_group, since) else {
        return Ok((None, Vec::new()));
    };
    let Some(group) = tx.find_fine_group(group_id).await? else {
        return Ok((None, Vec::new()));
    };
    if group.created_at < since {
        return Ok((None, Vec::new()));
    }
    Ok((Some(group_id), tx.fines_in_group(group_id).await?))
}
