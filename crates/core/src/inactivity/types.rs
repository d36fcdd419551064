//! Inactivity cost domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabkeeper_shared::types::{InactivityCostId, Money, TransferId, UserId};

use crate::scan::ScanReport;

/// An administrative cost charged to an inactive user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactivityCost {
    /// Cost ID.
    pub id: InactivityCostId,
    /// Charged user.
    pub user_id: UserId,
    /// Debiting transfer.
    pub transfer_id: TransferId,
    /// Charged amount.
    pub amount: Money,
    /// When the cost was charged.
    pub created_at: DateTime<Utc>,
}

/// A charged cost and its effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargedCost {
    /// The cost record.
    pub cost: InactivityCost,
    /// Last ledger activity of the user before the charge.
    pub last_activity: DateTime<Utc>,
    /// Balance after the charge.
    pub balance_after: Money,
}

/// Result of one inactivity engine run.
pub type InactivityScanReport = ScanReport<ChargedCost>;
