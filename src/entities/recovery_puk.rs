use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One-time PUK belonging to a recovery code. The lowest-index VALID row is
/// the "current" PUK; plaintext values are never stored.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_recovery_puk")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub recovery_code_id: i64,
    pub puk_index: i64,
    /// Base64 HMAC of the PUK under a key derived from the recovery code.
    pub puk_hash: String,
    pub status: i64,
    pub timestamp_last_change: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryPukStatus {
    Valid,
    Used,
    Invalid,
}

impl RecoveryPukStatus {
    pub fn to_db(self) -> i64 {
        match self {
            RecoveryPukStatus::Valid => 1,
            RecoveryPukStatus::Used => 2,
            RecoveryPukStatus::Invalid => 3,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            1 => Some(RecoveryPukStatus::Valid),
            2 => Some(RecoveryPukStatus::Used),
            3 => Some(RecoveryPukStatus::Invalid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryPukStatus::Valid => "VALID",
            RecoveryPukStatus::Used => "USED",
            RecoveryPukStatus::Invalid => "INVALID",
        }
    }
}
