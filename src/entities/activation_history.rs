use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only log of activation status changes, written in the same
/// transaction as the change itself.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_activation_history")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub activation_id: String,
    pub activation_status: i64,
    pub timestamp_created: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
