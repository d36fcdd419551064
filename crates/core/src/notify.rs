//! Post-commit notifications.
//!
//! Jobs call the notifier only after their transaction committed. A failing
//! notifier never undoes a ledger change; the job logs the failure and
//! records it as a warning in its report.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::fines::types::IssuedFine;
use crate::inactivity::types::ChargedCost;
use crate::ledger::LedgerError;

/// Receives ledger events that users should hear about.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerNotifier: Send + Sync {
    /// A fine was issued.
    async fn fine_issued(&self, fine: &IssuedFine) -> Result<(), LedgerError>;

    /// An inactivity cost was charged.
    async fn inactivity_charged(&self, cost: &ChargedCost) -> Result<(), LedgerError>;
}

/// Notifier that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl LedgerNotifier for NoopNotifier {
    async fn fine_issued(&self, _fine: &IssuedFine) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn inactivity_charged(&self, _cost: &ChargedCost) -> Result<(), LedgerError> {
        Ok(())
    }
}
