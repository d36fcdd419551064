//! Structural changes expressed as SQL.

use async_trait::async_trait;
use sea_orm::ConnectionTrait;
use tabkeeper_core::ledger::LedgerError;
use tabkeeper_core::verifier::StructuralChange;
use tracing::debug;

use crate::error::map_db_err;
use crate::store::PgLedgerTx;

/// A structural change made of raw SQL statements, run in order inside the
/// verifier's transaction.
///
/// ```ignore
/// let merge = SqlStructuralChange::new("merge products 12 into 7")
///     .statement("UPDATE sub_transaction_rows SET product_id = 7 WHERE product_id = 12");
/// verifier.run_structural_change(&affected_users, &merge).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SqlStructuralChange {
    name: String,
    statements: Vec<String>,
}

impl SqlStructuralChange {
    /// Creates an empty change.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statements: Vec::new(),
        }
    }

    /// Appends a statement.
    #[must_use]
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }
}

#[async_trait]
impl StructuralChange<PgLedgerTx> for SqlStructuralChange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, tx: &mut PgLedgerTx) -> Result<(), LedgerError> {
        for sql in &self.statements {
            let result = tx
                .connection()
                .execute_unprepared(sql)
                .await
                .map_err(map_db_err)?;
            debug!(change = %self.name, rows = result.rows_affected(), "Statement applied");
        }
        Ok(())
    }
}
