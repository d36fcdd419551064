//! `SeaORM` Entity for the ledger columns of the users table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub active: bool,
    pub inactive_notified: bool,
    pub current_fines_id: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user_fine_groups::Entity",
        from = "Column::CurrentFinesId",
        to = "super::user_fine_groups::Column::Id"
    )]
    CurrentFines,
}

impl ActiveModelBehavior for ActiveModel {}
