//! Ledger events and balances.
//!
//! This module implements the balance side of the ledger:
//! - Ledger events (transfers and purchase rows)
//! - Balance aggregation, full and incremental
//! - The per-user balance cache
//! - Balance queries and historical cutoffs
//! - The single write path for new events
//! - Error types for ledger operations

pub mod balance;
pub mod cache;
pub mod error;
pub mod event;
pub mod query;
pub mod retry;
pub mod service;
pub mod writer;

#[cfg(test)]
mod balance_props;

pub use balance::{Balance, BalanceAccumulator, CachedBalance, DebtStreak, aggregate, debt_streak};
pub use cache::BalanceCache;
pub use error::LedgerError;
pub use event::{
    Checkout, Cutoff, EventRange, LedgerEvent, NewCheckout, NewPurchaseRow, NewSubTransaction,
    NewTransfer, PurchaseRow, Transfer, TransferCause,
};
pub use retry::with_retry;
pub use service::{BalanceFilter, BalanceService};
pub use writer::{LedgerWriter, PostedCheckout, PostedTransfer};
