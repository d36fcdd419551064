//! `SeaORM` entities for the ledger tables.

pub mod balances;
pub mod fines;
pub mod inactive_administrative_costs;
pub mod sub_transaction_rows;
pub mod sub_transactions;
pub mod transactions;
pub mod transfers;
pub mod user_fine_groups;
pub mod users;
pub mod write_offs;
