//! Core ledger logic for Tabkeeper.
//!
//! This crate derives user balances from the append-only ledger and runs the
//! automated jobs that write to it. It has ZERO web or database dependencies:
//! persistence is reached through the traits in [`store`], implemented by
//! `tabkeeper-db` for PostgreSQL and by [`store::memory`] for tests.
//!
//! # Modules
//!
//! - `ledger` - Ledger events, balance aggregation, balance cache and writers
//! - `store` - Persistence traits and the in-memory store
//! - `fines` - Fines for users who stay in debt
//! - `inactivity` - Administrative cost for inactive users
//! - `verifier` - Balance snapshots around structural changes
//! - `notify` - Post-commit notifications
//! - `scan` - Reports of batch jobs
//! - `clock` - Time source for writers and jobs

pub mod clock;
pub mod fines;
pub mod inactivity;
pub mod ledger;
pub mod notify;
pub mod scan;
pub mod store;
pub mod verifier;
