use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Short-lived token credential bound to an activation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_token")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub token_id: String,
    pub token_secret: String,
    pub activation_id: String,
    pub signature_type: String,
    pub timestamp_created: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
