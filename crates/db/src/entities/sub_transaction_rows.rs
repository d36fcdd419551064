//! `SeaORM` Entity for sub_transaction_rows table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "sub_transaction_rows")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub sub_transaction_id: i64,
    pub product_id: i64,
    pub product_revision: i32,
    pub quantity: i64,
    pub price_amount: i64,
    pub price_currency: String,
    pub price_precision: i16,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sub_transactions::Entity",
        from = "Column::SubTransactionId",
        to = "super::sub_transactions::Column::Id"
    )]
    SubTransactions,
}

impl Related<super::sub_transactions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubTransactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
