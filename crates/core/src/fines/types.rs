//! Fine domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabkeeper_shared::types::{FineGroupId, FineId, Money, TransferId, UserId, WriteOffId};

use crate::scan::ScanReport;

/// A run of fines issued during one uninterrupted debt streak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FineGroup {
    /// Group ID.
    pub id: FineGroupId,
    /// Fined user.
    pub user_id: UserId,
    /// Transfer that waived the group's fines, if any.
    pub waived_transfer_id: Option<TransferId>,
    /// When the first fine of the group was issued.
    pub created_at: DateTime<Utc>,
}

/// A fine together with the transfer that debited it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fine {
    /// Fine ID.
    pub id: FineId,
    /// Group the fine belongs to.
    pub group_id: FineGroupId,
    /// Fined user.
    pub user_id: UserId,
    /// Transfer that debited the fine.
    pub transfer_id: TransferId,
    /// Fine amount.
    pub amount: Money,
    /// Balance the fine was computed from.
    pub reference_balance: Money,
    /// When the fine was issued.
    pub created_at: DateTime<Utc>,
}

/// Input for a new fine record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFine {
    /// Group the fine belongs to.
    pub group_id: FineGroupId,
    /// Fined user.
    pub user_id: UserId,
    /// Transfer that debited the fine.
    pub transfer_id: TransferId,
    /// Fine amount.
    pub amount: Money,
    /// Balance the fine was computed from.
    pub reference_balance: Money,
}

/// A written-off debt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOff {
    /// Write-off ID.
    pub id: WriteOffId,
    /// User whose debt was written off.
    pub user_id: UserId,
    /// Crediting transfer.
    pub transfer_id: TransferId,
    /// Written-off amount.
    pub amount: Money,
    /// When the debt was written off.
    pub created_at: DateTime<Utc>,
}

/// Where a user stands in the debt lifecycle.
///
/// ```text
/// NoDebt -> InDebt -> Fined(1) -> Fined(n) -> WriteOffCandidate
///    ^________|__________|___________|_______________|   (balance >= 0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DebtState {
    /// Balance is zero or positive.
    NoDebt,
    /// Balance is negative, no fine issued yet in this streak.
    InDebt {
        /// When the balance turned negative.
        since: DateTime<Utc>,
    },
    /// Fines have been issued in this streak.
    Fined {
        /// When the balance turned negative.
        since: DateTime<Utc>,
        /// Unpaid fines in the open group.
        count: u32,
    },
    /// Enough fines went unpaid that the debt may be written off.
    WriteOffCandidate {
        /// When the balance turned negative.
        since: DateTime<Utc>,
        /// Unpaid fines in the open group.
        count: u32,
    },
}

/// A fine issued by the fine engine or by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedFine {
    /// The fine record.
    pub fine: Fine,
    /// Balance after the fine.
    pub balance_after: Money,
    /// Fines in the open group, this one included.
    pub fine_count: u32,
}

/// Result of one fine engine run.
pub type FineScanReport = ScanReport<IssuedFine>;
