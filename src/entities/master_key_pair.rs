use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Application-scoped EC P-256 key pair; the latest row per application is
/// the "current" pair. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_master_keypair")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub application_id: i64,
    pub name: String,
    /// Base64 of the raw private scalar.
    pub master_key_private: String,
    /// Base64 of the uncompressed public point.
    pub master_key_public: String,
    pub timestamp_created: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
