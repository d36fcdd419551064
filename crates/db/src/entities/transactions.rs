//! `SeaORM` Entity for transactions table (point of sale checkouts).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub from_user_id: i64,
    pub created_by_id: i64,
    pub point_of_sale_id: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sub_transactions::Entity")]
    SubTransactions,
}

impl Related<super::sub_transactions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubTransactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
