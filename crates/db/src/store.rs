//! PostgreSQL implementation of the ledger store.
//!
//! A [`PgLedgerTx`] wraps one database transaction at the default READ
//! COMMITTED level. Per-user serialization uses transaction-scoped advisory
//! locks keyed by user id, released automatically on commit or rollback.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set},
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend,
    EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Statement,
    TransactionTrait,
};
use tabkeeper_core::fines::{Fine, FineGroup, NewFine, WriteOff};
use tabkeeper_core::inactivity::InactivityCost;
use tabkeeper_core::ledger::{
    Balance, CachedBalance, Checkout, EventRange, LedgerError, NewCheckout, NewTransfer,
    PurchaseRow, Transfer, TransferCause,
};
use tabkeeper_core::store::{LedgerStore, LedgerTx, LedgerUser, UserFilter};
use tabkeeper_shared::types::{
    FineGroupId, Money, PageRequest, SubTransactionId, SubTransactionRowId, TransactionId,
    TransferId, UserId,
};
use tracing::debug;

use crate::convert::{self, precision, to_db, to_utc};
use crate::entities::{
    balances, fines, inactive_administrative_costs, sub_transaction_rows, sub_transactions,
    transactions, transfers, user_fine_groups, users, write_offs,
};
use crate::error::map_db_err;

/// Latest of account creation, last transfer, last purchase and last sale.
const LAST_ACTIVITY_EXPR: &str = r"
    GREATEST(
        u.created_at,
        (SELECT MAX(t.created_at) FROM transfers t
            WHERE t.from_user_id = u.id OR t.to_user_id = u.id),
        (SELECT MAX(tr.created_at) FROM transactions tr
            WHERE tr.from_user_id = u.id),
        (SELECT MAX(tr.created_at) FROM sub_transactions s
            JOIN transactions tr ON tr.id = s.transaction_id
            WHERE s.to_user_id = u.id)
    )";

const PURCHASES_SQL: &str = r"
SELECT
    r.id,
    tr.id AS transaction_id,
    s.id AS sub_transaction_id,
    tr.from_user_id AS payer,
    s.to_user_id AS seller,
    r.product_id,
    r.product_revision,
    r.quantity,
    r.price_amount,
    r.price_currency,
    r.price_precision,
    tr.created_at
FROM sub_transaction_rows r
JOIN sub_transactions s ON s.id = r.sub_transaction_id
JOIN transactions tr ON tr.id = s.transaction_id
WHERE (tr.from_user_id = $1 OR s.to_user_id = $1)
  AND ($2::BIGINT IS NULL OR tr.id > $2)
  AND ($3::TIMESTAMPTZ IS NULL OR tr.created_at <= $3)
ORDER BY tr.id, r.id
";

#[derive(Debug, FromQueryResult)]
struct PurchaseRecord {
    id: i64,
    transaction_id: i64,
    sub_transaction_id: i64,
    payer: i64,
    seller: i64,
    product_id: i64,
    product_revision: i32,
    quantity: i64,
    price_amount: i64,
    price_currency: String,
    price_precision: i16,
    created_at: DateTimeWithTimeZone,
}

impl PurchaseRecord {
    fn into_row(self) -> Result<PurchaseRow, LedgerError> {
        Ok(PurchaseRow {
            id: SubTransactionRowId(self.id),
            transaction_id: TransactionId(self.transaction_id),
            sub_transaction_id: SubTransactionId(self.sub_transaction_id),
            payer: UserId(self.payer),
            seller: UserId(self.seller),
            product_id: self.product_id,
            product_revision: self.product_revision,
            quantity: self.quantity,
            unit_price: convert::money(
                self.price_amount,
                &self.price_currency,
                self.price_precision,
            )?,
            created_at: to_utc(self.created_at),
        })
    }
}

#[derive(Debug, FromQueryResult)]
struct LastActivity {
    last_activity: Option<DateTimeWithTimeZone>,
}

#[derive(Debug, FromQueryResult)]
struct UserIdRecord {
    id: i64,
}

/// Ledger store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    db: DatabaseConnection,
}

impl PgLedgerStore {
    /// Creates a store over a connection pool.
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Creates an active user account.
    ///
    /// Accounts are managed outside the ledger; this exists for seeding and
    /// tests.
    pub async fn create_user(&self, created_at: DateTime<Utc>) -> Result<UserId, LedgerError> {
        let model = users::ActiveModel {
            id: NotSet,
            active: Set(true),
            inactive_notified: Set(false),
            current_fines_id: Set(None),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.db)
        .await
        .map_err(map_db_err)?;
        Ok(UserId(model.id))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        let txn = self.db.begin().await.map_err(map_db_err)?;
        Ok(PgLedgerTx {
            txn,
            locked: BTreeSet::new(),
        })
    }
}

/// Transaction over a [`PgLedgerStore`].
pub struct PgLedgerTx {
    txn: DatabaseTransaction,
    locked: BTreeSet<UserId>,
}

impl std::fmt::Debug for PgLedgerTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLedgerTx")
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl PgLedgerTx {
    /// The underlying database transaction.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    fn statement(sql: &str, values: Vec<sea_orm::Value>) -> Statement {
        Statement::from_sql_and_values(DbBackend::Postgres, sql, values)
    }

    async fn update_user(
        &mut self,
        user_id: UserId,
        column: users::Column,
        value: sea_orm::Value,
    ) -> Result<(), LedgerError> {
        let result = users::Entity::update_many()
            .col_expr(column, Expr::value(value))
            .filter(users::Column::Id.eq(user_id.0))
            .exec(&self.txn)
            .await
            .map_err(map_db_err)?;
        if result.rows_affected == 0 {
            return Err(LedgerError::UserNotFound(user_id));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn commit(self) -> Result<(), LedgerError> {
        self.txn.commit().await.map_err(map_db_err)
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.txn.rollback().await.map_err(map_db_err)
    }

    async fn lock_user(&mut self, user_id: UserId) -> Result<(), LedgerError> {
        if !self.locked.insert(user_id) {
            return Ok(());
        }
        self.txn
            .execute(Self::statement(
                "SELECT pg_advisory_xact_lock($1)",
                vec![user_id.0.into()],
            ))
            .await
            .map_err(map_db_err)?;
        debug!(%user_id, "User lock taken");
        Ok(())
    }

    async fn find_user(&mut self, user_id: UserId) -> Result<Option<LedgerUser>, LedgerError> {
        Ok(users::Entity::find_by_id(user_id.0)
            .one(&self.txn)
            .await
            .map_err(map_db_err)?
            .map(convert::user))
    }

    async fn list_user_ids(
        &mut self,
        filter: &UserFilter,
        page: Option<&PageRequest>,
    ) -> Result<(Vec<UserId>, u64), LedgerError> {
        let mut query = users::Entity::find();
        if filter.only_active {
            query = query.filter(users::Column::Active.eq(true));
        }
        if let Some(ids) = &filter.user_ids {
            query = query.filter(users::Column::Id.is_in(ids.iter().map(|id| id.0)));
        }

        let total = query.clone().count(&self.txn).await.map_err(map_db_err)?;

        let mut select = query
            .select_only()
            .column(users::Column::Id)
            .order_by_asc(users::Column::Id);
        if let Some(page) = page {
            select = select.offset(page.offset()).limit(page.limit());
        }
        let ids: Vec<i64> = select
            .into_tuple()
            .all(&self.txn)
            .await
            .map_err(map_db_err)?;

        Ok((ids.into_iter().map(UserId).collect(), total))
    }

    async fn set_inactive_notified(
        &mut self,
        user_id: UserId,
        notified: bool,
    ) -> Result<(), LedgerError> {
        self.update_user(user_id, users::Column::InactiveNotified, notified.into())
            .await
    }

    async fn set_current_fine_group(
        &mut self,
        user_id: UserId,
        group_id: Option<FineGroupId>,
    ) -> Result<(), LedgerError> {
        self.update_user(
            user_id,
            users::Column::CurrentFinesId,
            group_id.map(|id| id.0).into(),
        )
        .await
    }

    async fn last_activity_at(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let sql =
            format!("SELECT {LAST_ACTIVITY_EXPR} AS last_activity FROM users u WHERE u.id = $1");
        let record = LastActivity::find_by_statement(Self::statement(&sql, vec![user_id.0.into()]))
            .one(&self.txn)
            .await
            .map_err(map_db_err)?;
        Ok(record.and_then(|r| r.last_activity).map(to_utc))
    }

    async fn inactivity_candidates(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<UserId>, LedgerError> {
        let sql = format!(
            "SELECT a.id FROM (
                SELECT u.id, {LAST_ACTIVITY_EXPR} AS last_activity
                FROM users u
                WHERE u.active AND NOT u.inactive_notified
            ) a
            WHERE a.last_activity < $1
            ORDER BY a.id"
        );
        let records = UserIdRecord::find_by_statement(Self::statement(
            &sql,
            vec![to_db(before).into()],
        ))
        .all(&self.txn)
        .await
        .map_err(map_db_err)?;
        Ok(records.into_iter().map(|r| UserId(r.id)).collect())
    }

    async fn find_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        transfers::Entity::find_by_id(id.0)
            .one(&self.txn)
            .await
            .map_err(map_db_err)?
            .map(convert::transfer)
            .transpose()
    }

    async fn find_transfers_by_cause(
        &mut self,
        cause: TransferCause,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let reference = match cause.reference() {
            Some(reference) => transfers::Column::CauseRef.eq(reference),
            None => transfers::Column::CauseRef.is_null(),
        };
        transfers::Entity::find()
            .filter(transfers::Column::CauseKind.eq(cause.kind()))
            .filter(reference)
            .order_by_asc(transfers::Column::Id)
            .all(&self.txn)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(convert::transfer)
            .collect()
    }

    async fn transfers_for(
        &mut self,
        user_id: UserId,
        range: &EventRange,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let mut condition = Condition::all().add(
            Condition::any()
                .add(transfers::Column::FromUserId.eq(user_id.0))
                .add(transfers::Column::ToUserId.eq(user_id.0)),
        );
        if let Some(after) = range.after_transfer {
            condition = condition.add(transfers::Column::Id.gt(after.0));
        }
        if let Some(until) = range.until_transfer {
            condition = condition.add(transfers::Column::Id.lte(until.0));
        }
        if let Some(until) = range.until_date {
            condition = condition.add(transfers::Column::CreatedAt.lte(to_db(until)));
        }

        transfers::Entity::find()
            .filter(condition)
            .order_by_asc(transfers::Column::Id)
            .all(&self.txn)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(convert::transfer)
            .collect()
    }

    async fn purchases_for(
        &mut self,
        user_id: UserId,
        range: &EventRange,
    ) -> Result<Vec<PurchaseRow>, LedgerError> {
        let values = vec![
            user_id.0.into(),
            range.after_transaction.map(|id| id.0).into(),
            range.until_date.map(to_db).into(),
        ];
        PurchaseRecord::find_by_statement(Self::statement(PURCHASES_SQL, values))
            .all(&self.txn)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(PurchaseRecord::into_row)
            .collect()
    }

    async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
        created_at: DateTime<Utc>,
    ) -> Result<Transfer, LedgerError> {
        let model = transfers::ActiveModel {
            id: NotSet,
            from_user_id: Set(transfer.from.map(|id| id.0)),
            to_user_id: Set(transfer.to.map(|id| id.0)),
            amount: Set(transfer.amount.amount),
            currency: Set(transfer.amount.currency.to_string()),
            precision: Set(precision(transfer.amount)?),
            description: Set(transfer.description.clone()),
            cause_kind: Set(transfer.cause.kind().to_owned()),
            cause_ref: Set(transfer.cause.reference()),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.txn)
        .await
        .map_err(map_db_err)?;
        convert::transfer(model)
    }

    async fn insert_checkout(
        &mut self,
        checkout: &NewCheckout,
        created_at: DateTime<Utc>,
    ) -> Result<Checkout, LedgerError> {
        let header = transactions::ActiveModel {
            id: NotSet,
            from_user_id: Set(checkout.payer.0),
            created_by_id: Set(checkout.created_by.0),
            point_of_sale_id: Set(checkout.point_of_sale_id),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.txn)
        .await
        .map_err(map_db_err)?;
        let created_at = to_utc(header.created_at);

        let mut rows = Vec::new();
        for sub in &checkout.sub_transactions {
            let stored_sub = sub_transactions::ActiveModel {
                id: NotSet,
                transaction_id: Set(header.id),
                to_user_id: Set(sub.seller.0),
                container_id: Set(sub.container_id),
            }
            .insert(&self.txn)
            .await
            .map_err(map_db_err)?;

            for row in &sub.rows {
                let stored_row = sub_transaction_rows::ActiveModel {
                    id: NotSet,
                    sub_transaction_id: Set(stored_sub.id),
                    product_id: Set(row.product_id),
                    product_revision: Set(row.product_revision),
                    quantity: Set(row.quantity),
                    price_amount: Set(row.unit_price.amount),
                    price_currency: Set(row.unit_price.currency.to_string()),
                    price_precision: Set(precision(row.unit_price)?),
                }
                .insert(&self.txn)
                .await
                .map_err(map_db_err)?;

                rows.push(PurchaseRow {
                    id: SubTransactionRowId(stored_row.id),
                    transaction_id: TransactionId(header.id),
                    sub_transaction_id: SubTransactionId(stored_sub.id),
                    payer: checkout.payer,
                    seller: sub.seller,
                    product_id: row.product_id,
                    product_revision: row.product_revision,
                    quantity: row.quantity,
                    unit_price: row.unit_price,
                    created_at,
                });
            }
        }

        Ok(Checkout {
            id: TransactionId(header.id),
            payer: checkout.payer,
            created_at,
            rows,
        })
    }

    async fn cached_balance(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<CachedBalance>, LedgerError> {
        balances::Entity::find_by_id(user_id.0)
            .one(&self.txn)
            .await
            .map_err(map_db_err)?
            .map(convert::cached_balance)
            .transpose()
    }

    async fn store_balance(
        &mut self,
        balance: &Balance,
        updated_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let model = balances::ActiveModel {
            user_id: Set(balance.user_id.0),
            amount: Set(balance.amount.amount),
            currency: Set(balance.amount.currency.to_string()),
            precision: Set(precision(balance.amount)?),
            last_transfer_id: Set(balance.last_transfer_id.map(|id| id.0)),
            last_transfer_date: Set(balance.last_transfer_date.map(to_db)),
            last_transaction_id: Set(balance.last_transaction_id.map(|id| id.0)),
            last_transaction_date: Set(balance.last_transaction_date.map(to_db)),
            updated_at: Set(to_db(updated_at)),
        };

        balances::Entity::insert(model)
            .on_conflict(
                OnConflict::column(balances::Column::UserId)
                    .update_columns([
                        balances::Column::Amount,
                        balances::Column::Currency,
                        balances::Column::Precision,
                        balances::Column::LastTransferId,
                        balances::Column::LastTransferDate,
                        balances::Column::LastTransactionId,
                        balances::Column::LastTransactionDate,
                        balances::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.txn)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn delete_balances(&mut self, user_ids: Option<&[UserId]>) -> Result<u64, LedgerError> {
        let mut delete = balances::Entity::delete_many();
        if let Some(ids) = user_ids {
            delete = delete.filter(balances::Column::UserId.is_in(ids.iter().map(|id| id.0)));
        }
        let result = delete.exec(&self.txn).await.map_err(map_db_err)?;
        Ok(result.rows_affected)
    }

    async fn find_fine_group(
        &mut self,
        id: FineGroupId,
    ) -> Result<Option<FineGroup>, LedgerError> {
        Ok(user_fine_groups::Entity::find_by_id(id.0)
            .one(&self.txn)
            .await
            .map_err(map_db_err)?
            .map(convert::fine_group))
    }

    async fn insert_fine_group(
        &mut self,
        user_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Result<FineGroup, LedgerError> {
        let model = user_fine_groups::ActiveModel {
            id: NotSet,
            user_id: Set(user_id.0),
            waived: Set(false),
            waived_transfer_id: Set(None),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.txn)
        .await
        .map_err(map_db_err)?;
        Ok(convert::fine_group(model))
    }

    async fn set_fine_group_waived(
        &mut self,
        id: FineGroupId,
        transfer_id: TransferId,
    ) -> Result<(), LedgerError> {
        let result = user_fine_groups::Entity::update_many()
            .col_expr(user_fine_groups::Column::Waived, Expr::value(true))
            .col_expr(
                user_fine_groups::Column::WaivedTransferId,
                Expr::value(transfer_id.0),
            )
            .filter(user_fine_groups::Column::Id.eq(id.0))
            .exec(&self.txn)
            .await
            .map_err(map_db_err)?;
        if result.rows_affected == 0 {
            return Err(LedgerError::FineGroupNotFound(id));
        }
        Ok(())
    }

    async fn fines_in_group(&mut self, id: FineGroupId) -> Result<Vec<Fine>, LedgerError> {
        fines::Entity::find()
            .filter(fines::Column::UserFineGroupId.eq(id.0))
            .order_by_asc(fines::Column::Id)
            .all(&self.txn)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(convert::fine)
            .collect()
    }

    async fn insert_fine(
        &mut self,
        fine: &NewFine,
        created_at: DateTime<Utc>,
    ) -> Result<Fine, LedgerError> {
        fine.amount
            .checked_sub(fine.reference_balance)
            .map_err(|err| LedgerError::in_ledger_of(fine.user_id, err))?;

        let model = fines::ActiveModel {
            id: NotSet,
            user_fine_group_id: Set(fine.group_id.0),
            user_id: Set(fine.user_id.0),
            transfer_id: Set(fine.transfer_id.0),
            amount: Set(fine.amount.amount),
            reference_balance: Set(fine.reference_balance.amount),
            currency: Set(fine.amount.currency.to_string()),
            precision: Set(precision(fine.amount)?),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.txn)
        .await
        .map_err(map_db_err)?;
        convert::fine(model)
    }

    async fn insert_write_off(
        &mut self,
        user_id: UserId,
        transfer_id: TransferId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Result<WriteOff, LedgerError> {
        let model = write_offs::ActiveModel {
            id: NotSet,
            user_id: Set(user_id.0),
            transfer_id: Set(transfer_id.0),
            amount: Set(amount.amount),
            currency: Set(amount.currency.to_string()),
            precision: Set(precision(amount)?),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.txn)
        .await
        .map_err(map_db_err)?;
        convert::write_off(model)
    }

    async fn insert_inactivity_cost(
        &mut self,
        user_id: UserId,
        transfer_id: TransferId,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Result<InactivityCost, LedgerError> {
        let model = inactive_administrative_costs::ActiveModel {
            id: NotSet,
            user_id: Set(user_id.0),
            transfer_id: Set(transfer_id.0),
            amount: Set(amount.amount),
            currency: Set(amount.currency.to_string()),
            precision: Set(precision(amount)?),
            created_at: Set(to_db(created_at)),
        }
        .insert(&self.txn)
        .await
        .map_err(map_db_err)?;
        convert::inactivity_cost(model)
    }
}
