//! Fines for users who stay in debt.
//!
//! A user whose balance has been negative for longer than the configured
//! threshold is fined a percentage of the debt. Fines of one debt streak
//! share a fine group, which can be waived as a whole. After enough unpaid
//! fines the debt becomes a write-off candidate.

pub mod engine;
pub mod policy;
pub mod types;

#[cfg(test)]
mod policy_props;

pub use engine::{FineEngine, WaivedFines, WrittenOff};
pub use policy::FinePolicy;
pub use types::{DebtState, Fine, FineGroup, FineScanReport, IssuedFine, NewFine, WriteOff};
