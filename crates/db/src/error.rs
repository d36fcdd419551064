//! Mapping of database errors onto [`LedgerError`].

use sea_orm::{DbErr, RuntimeErr};
use tabkeeper_core::ledger::LedgerError;

/// SQLSTATE codes that mean the transaction lost a race and may be retried:
/// serialization failure, deadlock, lock not available.
const RETRYABLE_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

/// Returns true if a SQLSTATE code signals a retryable conflict.
#[must_use]
pub fn is_conflict_sqlstate(code: &str) -> bool {
    RETRYABLE_SQLSTATES.contains(&code)
}

/// SQLSTATE of the underlying database error, if any.
#[must_use]
pub fn sqlstate(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => database_code(e),
        _ => None,
    }
}

/// SQLSTATE reported by the server, if the driver error carries one.
fn database_code(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(std::borrow::Cow::into_owned)
}

/// Maps a database error onto a ledger error.
///
/// Serialization failures, deadlocks and lock timeouts become
/// [`LedgerError::ConcurrencyConflict`]; everything else is a
/// [`LedgerError::Database`] error.
pub fn map_db_err(err: DbErr) -> LedgerError {
    match sqlstate(&err) {
        Some(code) if is_conflict_sqlstate(&code) => {
            LedgerError::ConcurrencyConflict(format!("SQLSTATE {code}: {err}"))
        }
        _ => LedgerError::Database(err.to_string()),
    }
}
