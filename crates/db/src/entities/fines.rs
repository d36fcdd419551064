//! `SeaORM` Entity for fines table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "fines")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_fine_group_id: i64,
    pub user_id: i64,
    pub transfer_id: i64,
    pub amount: i64,
    pub reference_balance: i64,
    pub currency: String,
    pub precision: i16,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user_fine_groups::Entity",
        from = "Column::UserFineGroupId",
        to = "super::user_fine_groups::Column::Id"
    )]
    UserFineGroups,
}

impl Related<super::user_fine_groups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserFineGroups.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
