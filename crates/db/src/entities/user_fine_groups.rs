//! `SeaORM` Entity for user_fine_groups table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "user_fine_groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub waived: bool,
    pub waived_transfer_id: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::fines::Entity")]
    Fines,
}

impl Related<super::fines::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
