use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only record of every signature verification attempt.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_signature_audit")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub activation_id: String,
    /// Counter value before the attempt was evaluated.
    pub activation_counter: i64,
    pub activation_status: i64,
    pub signature_type: String,
    /// Base64 SHA-256 of the signed data.
    pub data_hash: String,
    pub valid: i64,
    pub note: Option<String>,
    pub timestamp_created: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
