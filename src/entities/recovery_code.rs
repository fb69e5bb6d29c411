use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_recovery_code")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub application_id: i64,
    pub user_id: String,
    /// Set when the code was issued together with an activation.
    pub activation_id: Option<String>,
    pub recovery_code: String,
    pub status: i64,
    pub failed_attempts: i64,
    pub max_failed_attempts: i64,
    pub timestamp_created: i64,
    pub timestamp_last_used: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryCodeStatus {
    Created,
    Active,
    Blocked,
    Revoked,
}

impl RecoveryCodeStatus {
    pub fn to_db(self) -> i64 {
        match self {
            RecoveryCodeStatus::Created => 1,
            RecoveryCodeStatus::Active => 2,
            RecoveryCodeStatus::Blocked => 3,
            RecoveryCodeStatus::Revoked => 4,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            1 => Some(RecoveryCodeStatus::Created),
            2 => Some(RecoveryCodeStatus::Active),
            3 => Some(RecoveryCodeStatus::Blocked),
            4 => Some(RecoveryCodeStatus::Revoked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryCodeStatus::Created => "CREATED",
            RecoveryCodeStatus::Active => "ACTIVE",
            RecoveryCodeStatus::Blocked => "BLOCKED",
            RecoveryCodeStatus::Revoked => "REVOKED",
        }
    }
}

impl Model {
    pub fn code_status(&self) -> RecoveryCodeStatus {
        RecoveryCodeStatus::from_db(self.status).unwrap_or(RecoveryCodeStatus::Revoked)
    }
}
