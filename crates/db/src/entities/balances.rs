//! `SeaORM` Entity for balances table (the balance cache).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "balances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: i64,
    pub amount: i64,
    pub currency: String,
    pub precision: i16,
    pub last_transfer_id: Option<i64>,
    pub last_transfer_date: Option<DateTimeWithTimeZone>,
    pub last_transaction_id: Option<i64>,
    pub last_transaction_date: Option<DateTimeWithTimeZone>,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
