//! Reports of scheduled ledger jobs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabkeeper_shared::types::UserId;

use crate::ledger::LedgerError;
use crate::store::LedgerTx;

/// Why a user was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The balance is not negative.
    NotInDebt,
    /// The balance has not been negative long enough.
    NotDue,
    /// The computed amount rounds down to zero.
    ZeroAmount,
    /// Nothing left to charge.
    NoPositiveBalance,
    /// Another run already handled the user.
    AlreadyProcessed,
}

/// A user the job could not process. The rest of the run is unaffected.
#[derive(Debug)]
pub struct ScanFailure {
    /// The user.
    pub user_id: UserId,
    /// What went wrong.
    pub error: LedgerError,
}

/// Outcome of a batch job over many users.
///
/// Each user is handled in their own transaction, so a failure for one user
/// never rolls back the others.
#[derive(Debug)]
pub struct ScanReport<T> {
    /// Evaluation time of the run.
    pub run_at: DateTime<Utc>,
    /// Whether changes were rolled back instead of committed.
    pub dry_run: bool,
    /// Users the job was evaluated for.
    pub examined: usize,
    /// What the job did.
    pub processed: Vec<T>,
    /// Users left alone.
    pub skipped: Vec<(UserId, SkipReason)>,
    /// Users whose debt streak ended and whose open fine group was closed.
    pub settled: Vec<UserId>,
    /// Users whose transaction failed.
    pub failures: Vec<ScanFailure>,
    /// Post-commit problems that did not undo anything, such as a failed
    /// notification.
    pub warnings: Vec<String>,
}

impl<T> ScanReport<T> {
    /// An empty report.
    #[must_use]
    pub const fn new(run_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_at,
            dry_run,
            examined: 0,
            processed: Vec::new(),
            skipped: Vec::new(),
            settled: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if every user was handled without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ends a job's per-user transaction: rolled back on a dry run, committed
/// otherwise.
pub(crate) async fn finish<T: LedgerTx>(tx: T, dry_run: bool) -> Result<(), LedgerError> {
    if dry_run {
        tx.rollback().await
    } else {
        tx.commit().await
    }
}
