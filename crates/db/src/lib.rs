//! PostgreSQL persistence for the Tabkeeper ledger.
//!
//! This crate provides:
//! - `SeaORM` entity definitions for the ledger tables
//! - [`PgLedgerStore`], the PostgreSQL implementation of the core store traits
//! - [`SqlStructuralChange`] for verified schema-level rewrites
//! - Database migrations

pub mod entities;
pub mod error;
pub mod migration;
pub mod store;
pub mod structural;

mod convert;

pub use error::map_db_err;
pub use store::{PgLedgerStore, PgLedgerTx};
pub use structural::SqlStructuralChange;

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tabkeeper_shared::config::DatabaseConfig;

/// Establishes a connection to the database.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    Database::connect(database_url).await
}

/// Establishes a connection pool sized by the configuration.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect_with(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    Database::connect(options).await
}
