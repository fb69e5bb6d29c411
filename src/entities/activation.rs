use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// The central activation record binding one device to one user within an
/// application. Status values map through `ActivationStatus`; timestamps
/// are Unix epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pa_activation")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub activation_id: String,
    pub activation_code: String,
    pub activation_name: Option<String>,
    pub extras: Option<String>,
    pub user_id: String,
    pub application_id: i64,
    pub master_key_pair_id: i64,
    /// Base64 of the uncompressed server public point.
    pub server_public_key: String,
    /// Server private key, plaintext base64 or IV||ciphertext base64
    /// depending on `server_private_key_encryption`.
    pub server_private_key: String,
    pub server_private_key_encryption: i64,
    pub device_public_key: Option<String>,
    /// HMAC chain position; only ever increases.
    pub counter: i64,
    pub failed_attempts: i64,
    pub max_failed_attempts: i64,
    pub status: i64,
    pub blocked_reason: Option<String>,
    pub timestamp_created: i64,
    pub timestamp_last_used: i64,
    pub timestamp_activation_expire: i64,
    /// Protocol major version; null until the device reveals it.
    pub version: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Activation lifecycle states with their persistent tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationStatus {
    Created,
    OtpUsed,
    Active,
    Blocked,
    Removed,
}

impl ActivationStatus {
    pub fn to_db(self) -> i64 {
        match self {
            ActivationStatus::Created => 1,
            ActivationStatus::OtpUsed => 2,
            ActivationStatus::Active => 3,
            ActivationStatus::Blocked => 4,
            ActivationStatus::Removed => 5,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            1 => Some(ActivationStatus::Created),
            2 => Some(ActivationStatus::OtpUsed),
            3 => Some(ActivationStatus::Active),
            4 => Some(ActivationStatus::Blocked),
            5 => Some(ActivationStatus::Removed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivationStatus::Created => "CREATED",
            ActivationStatus::OtpUsed => "OTP_USED",
            ActivationStatus::Active => "ACTIVE",
            ActivationStatus::Blocked => "BLOCKED",
            ActivationStatus::Removed => "REMOVED",
        }
    }

    /// REMOVED is terminal; nothing transitions out of it.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActivationStatus::Removed)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, ActivationStatus::Created | ActivationStatus::OtpUsed)
    }
}

impl Model {
    pub fn activation_status(&self) -> ActivationStatus {
        ActivationStatus::from_db(self.status).unwrap_or(ActivationStatus::Removed)
    }
}
