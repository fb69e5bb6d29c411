//! Recovery codes and PUKs.
//!
//! A recovery code owns an ordered set of one-time PUKs; the lowest-index
//! VALID PUK is the current one. Consuming the current PUK re-activates the
//! user through the regular Init path inside the same transaction. Failed
//! attempts accumulate on the code and block it at the threshold, and every
//! failure reports the current PUK index back to the caller.

use std::sync::Arc;

use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, NotSet, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::activations::{ActivationRecovery, ActivationService, InitActivationRequest,
    InitActivationResponse};
use crate::applications::ApplicationService;
use crate::callbacks::CallbackDispatcher;
use crate::clock::Clock;
use crate::crypto::codes;
use crate::entities::recovery_code::{self, RecoveryCodeStatus};
use crate::entities::recovery_config;
use crate::entities::recovery_puk::{self, RecoveryPukStatus};
use crate::errors::ServiceError;
use crate::settings::Settings;
use crate::storage;

#[derive(Clone)]
pub struct RecoveryService {
    db: DatabaseConnection,
    settings: Arc<Settings>,
    callbacks: CallbackDispatcher,
    clock: Clock,
    activations: ActivationService,
    applications: ApplicationService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecoveryCodeRequest {
    pub application_id: i64,
    pub user_id: String,
    /// Number of PUKs to issue, 1..=10.
    pub puk_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecoveryCodeResponse {
    pub recovery_code_id: i64,
    pub recovery_code: String,
    pub status: String,
    /// Plaintext PUKs, returned exactly once.
    pub puks: Vec<RecoveryPukValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPukValue {
    pub puk_index: i64,
    pub puk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRecoveryCodeRequest {
    pub application_key: String,
    pub recovery_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRecoveryCodeResponse {
    pub recovery_code: String,
    pub already_confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LookupRecoveryCodesRequest {
    #[serde(default)]
    pub application_id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub activation_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRecoveryCodesResponse {
    pub recovery_codes: Vec<RecoveryCodeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCodeItem {
    pub recovery_code_id: i64,
    pub recovery_code: String,
    pub status: String,
    pub failed_attempts: i64,
    pub max_failed_attempts: i64,
    pub user_id: String,
    pub application_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_id: Option<String>,
    pub puks: Vec<RecoveryPukItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPukItem {
    pub puk_index: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRecoveryCodesRequest {
    pub recovery_code_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRecoveryCodesResponse {
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCodeActivationRequest {
    pub application_key: String,
    pub recovery_code: String,
    pub puk: String,
    #[serde(default)]
    pub max_failed_attempts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfigResponse {
    pub application_id: i64,
    pub activation_recovery_enabled: bool,
    pub recovery_postcard_enabled: bool,
}

impl RecoveryService {
    pub fn new(
        db: DatabaseConnection,
        settings: Arc<Settings>,
        callbacks: CallbackDispatcher,
        clock: Clock,
        activations: ActivationService,
        applications: ApplicationService,
    ) -> Self {
        Self {
            db,
            settings,
            callbacks,
            clock,
            activations,
            applications,
        }
    }

    /// Issue a standalone recovery code with a set of PUKs (postcard flow).
    pub async fn create_recovery_code(
        &self,
        request: &CreateRecoveryCodeRequest,
    ) -> Result<CreateRecoveryCodeResponse, ServiceError> {
        if request.user_id.is_empty() {
            return Err(ServiceError::NoUserId);
        }
        if !(1..=10).contains(&request.puk_count) {
            return Err(ServiceError::InvalidRequest(
                "puk count must be between 1 and 10".into(),
            ));
        }
        storage::find_application(&self.db, request.application_id)
            .await?
            .ok_or(ServiceError::NoApplicationId)?;

        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;

        if storage::find_standalone_recovery_code_for_user(&txn, request.application_id, &request.user_id)
            .await?
            .is_some()
        {
            return Err(ServiceError::RecoveryCodeAlreadyExists);
        }

        let recovery_code =
            generate_unique_code(&txn, &self.settings, request.application_id).await?;
        let code_row = recovery_code::ActiveModel {
            id: NotSet,
            application_id: Set(request.application_id),
            user_id: Set(request.user_id.clone()),
            activation_id: Set(None),
            recovery_code: Set(recovery_code.clone()),
            status: Set(RecoveryCodeStatus::Created.to_db()),
            failed_attempts: Set(0),
            max_failed_attempts: Set(self.settings.recovery.max_failed_attempts),
            timestamp_created: Set(now),
            timestamp_last_used: Set(None),
        }
        .insert(&txn)
        .await?;

        let mut puks = Vec::with_capacity(request.puk_count as usize);
        for index in 1..=request.puk_count {
            let puk = codes::generate_puk();
            recovery_puk::ActiveModel {
                id: NotSet,
                recovery_code_id: Set(code_row.id),
                puk_index: Set(index),
                puk_hash: Set(codes::hash_puk(&recovery_code, &puk)),
                status: Set(RecoveryPukStatus::Valid.to_db()),
                timestamp_last_change: Set(None),
            }
            .insert(&txn)
            .await?;
            puks.push(RecoveryPukValue {
                puk_index: index,
                puk,
            });
        }
        txn.commit().await?;
        info!(user_id = %request.user_id, "recovery code created");

        Ok(CreateRecoveryCodeResponse {
            recovery_code_id: code_row.id,
            recovery_code,
            status: RecoveryCodeStatus::Created.as_str().to_string(),
            puks,
        })
    }

    /// Confirm a delivered recovery code (CREATED to ACTIVE).
    pub async fn confirm_recovery_code(
        &self,
        request: &ConfirmRecoveryCodeRequest,
    ) -> Result<ConfirmRecoveryCodeResponse, ServiceError> {
        let credentials = self
            .applications
            .lookup_credentials(&request.application_key)
            .await?
            .ok_or_else(|| ServiceError::InvalidRequest("unknown application key".into()))?;

        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let code = storage::find_recovery_code_for_update(
            &txn,
            credentials.application_id,
            &request.recovery_code,
        )
        .await?
        .ok_or(ServiceError::InvalidRecoveryCode {
            current_recovery_puk_index: None,
        })?;

        let response = match code.code_status() {
            RecoveryCodeStatus::Created => {
                let mut active: recovery_code::ActiveModel = code.into();
                active.status = Set(RecoveryCodeStatus::Active.to_db());
                active.timestamp_last_used = Set(Some(now));
                active.update(&txn).await?;
                ConfirmRecoveryCodeResponse {
                    recovery_code: request.recovery_code.clone(),
                    already_confirmed: false,
                }
            }
            RecoveryCodeStatus::Active => ConfirmRecoveryCodeResponse {
                recovery_code: request.recovery_code.clone(),
                already_confirmed: true,
            },
            _ => {
                return Err(ServiceError::InvalidRecoveryCode {
                    current_recovery_puk_index: None,
                })
            }
        };
        txn.commit().await?;
        Ok(response)
    }

    pub async fn lookup_recovery_codes(
        &self,
        request: &LookupRecoveryCodesRequest,
    ) -> Result<LookupRecoveryCodesResponse, ServiceError> {
        let status = match &request.status {
            Some(value) => Some(parse_code_status(value)?.to_db()),
            None => None,
        };
        let codes = storage::lookup_recovery_codes(
            &self.db,
            request.application_id,
            request.user_id.as_deref(),
            request.activation_id.as_deref(),
            status,
        )
        .await?;

        let mut items = Vec::with_capacity(codes.len());
        for code in codes {
            let puks = storage::list_recovery_puks(&self.db, code.id).await?;
            items.push(RecoveryCodeItem {
                recovery_code_id: code.id,
                recovery_code: code.recovery_code.clone(),
                status: code.code_status().as_str().to_string(),
                failed_attempts: code.failed_attempts,
                max_failed_attempts: code.max_failed_attempts,
                user_id: code.user_id.clone(),
                application_id: code.application_id,
                activation_id: code.activation_id.clone(),
                puks: puks
                    .iter()
                    .map(|puk| RecoveryPukItem {
                        puk_index: puk.puk_index,
                        status: RecoveryPukStatus::from_db(puk.status)
                            .unwrap_or(RecoveryPukStatus::Invalid)
                            .as_str()
                            .to_string(),
                    })
                    .collect(),
            });
        }
        Ok(LookupRecoveryCodesResponse {
            recovery_codes: items,
        })
    }

    /// Revoke codes by ID and invalidate their remaining VALID PUKs.
    pub async fn revoke_recovery_codes(
        &self,
        request: &RevokeRecoveryCodesRequest,
    ) -> Result<RevokeRecoveryCodesResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let mut revoked = false;
        for id in &request.recovery_code_ids {
            let Some(code) = storage::find_recovery_code_by_id(&txn, *id).await? else {
                continue;
            };
            if code.code_status() == RecoveryCodeStatus::Revoked {
                continue;
            }
            let code_id = code.id;
            let mut active: recovery_code::ActiveModel = code.into();
            active.status = Set(RecoveryCodeStatus::Revoked.to_db());
            active.update(&txn).await?;
            invalidate_remaining_puks(&txn, code_id, now).await?;
            revoked = true;
        }
        txn.commit().await?;
        Ok(RevokeRecoveryCodesResponse { revoked })
    }

    /// Consume the current PUK of an ACTIVE recovery code and initialize a
    /// fresh activation for the same user and application.
    pub async fn recovery_code_activation(
        &self,
        request: &RecoveryCodeActivationRequest,
    ) -> Result<InitActivationResponse, ServiceError> {
        let credentials = self
            .applications
            .lookup_credentials(&request.application_key)
            .await?
            .ok_or_else(|| ServiceError::InvalidRequest("unknown application key".into()))?;

        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let code = storage::find_recovery_code_for_update(
            &txn,
            credentials.application_id,
            &request.recovery_code,
        )
        .await?
        .ok_or(ServiceError::InvalidRecoveryCode {
            current_recovery_puk_index: None,
        })?;

        let puks = storage::list_recovery_puks(&txn, code.id).await?;
        let current = puks
            .iter()
            .find(|puk| RecoveryPukStatus::from_db(puk.status) == Some(RecoveryPukStatus::Valid));
        let current_index = current.map(|puk| puk.puk_index);

        if code.code_status() != RecoveryCodeStatus::Active {
            return Err(ServiceError::InvalidRecoveryCode {
                current_recovery_puk_index: current_index,
            });
        }
        let Some(current_puk) = current else {
            return Err(ServiceError::InvalidRecoveryCode {
                current_recovery_puk_index: None,
            });
        };

        let expected_hash = codes::hash_puk(&request.recovery_code, &request.puk);
        let matches: bool = expected_hash
            .as_bytes()
            .ct_eq(current_puk.puk_hash.as_bytes())
            .into();

        if !matches {
            let failed_attempts = code.failed_attempts + 1;
            let blocks = failed_attempts >= code.max_failed_attempts;
            let mut active: recovery_code::ActiveModel = code.into();
            active.failed_attempts = Set(failed_attempts);
            active.timestamp_last_used = Set(Some(now));
            if blocks {
                active.status = Set(RecoveryCodeStatus::Blocked.to_db());
            }
            active.update(&txn).await?;
            txn.commit().await?;
            if blocks {
                info!(recovery_puk_index = ?current_index, "recovery code blocked after failed attempts");
            }
            return Err(ServiceError::InvalidRecoveryCode {
                current_recovery_puk_index: current_index,
            });
        }

        // Consume the PUK, reset the failure count, and revoke the code once
        // no VALID PUK remains.
        let remaining_valid = puks
            .iter()
            .filter(|puk| {
                puk.puk_index != current_puk.puk_index
                    && RecoveryPukStatus::from_db(puk.status) == Some(RecoveryPukStatus::Valid)
            })
            .count();
        let mut used: recovery_puk::ActiveModel = current_puk.clone().into();
        used.status = Set(RecoveryPukStatus::Used.to_db());
        used.timestamp_last_change = Set(Some(now));
        used.update(&txn).await?;

        let user_id = code.user_id.clone();
        let mut active: recovery_code::ActiveModel = code.into();
        active.failed_attempts = Set(0);
        active.timestamp_last_used = Set(Some(now));
        if remaining_valid == 0 {
            active.status = Set(RecoveryCodeStatus::Revoked.to_db());
        }
        active.update(&txn).await?;

        let (response, event) = self
            .activations
            .init_in_txn(
                &txn,
                &InitActivationRequest {
                    application_id: credentials.application_id,
                    user_id,
                    max_failed_attempts: request.max_failed_attempts,
                    timestamp_activation_expire: None,
                },
                now,
            )
            .await?;
        txn.commit().await?;
        self.callbacks.notify(event.application_id, &event.activation_id);
        info!(activation_id = %response.activation_id, "activation re-initialized from recovery code");
        Ok(response)
    }

    pub async fn get_recovery_config(
        &self,
        application_id: i64,
    ) -> Result<RecoveryConfigResponse, ServiceError> {
        let config = storage::find_recovery_config(&self.db, application_id).await?;
        Ok(match config {
            Some(config) => RecoveryConfigResponse {
                application_id,
                activation_recovery_enabled: config.activation_recovery_enabled != 0,
                recovery_postcard_enabled: config.recovery_postcard_enabled != 0,
            },
            None => RecoveryConfigResponse {
                application_id,
                activation_recovery_enabled: false,
                recovery_postcard_enabled: false,
            },
        })
    }

    pub async fn update_recovery_config(
        &self,
        application_id: i64,
        activation_recovery_enabled: bool,
        recovery_postcard_enabled: bool,
    ) -> Result<RecoveryConfigResponse, ServiceError> {
        storage::find_application(&self.db, application_id)
            .await?
            .ok_or(ServiceError::NoApplicationId)?;
        match storage::find_recovery_config(&self.db, application_id).await? {
            Some(config) => {
                let mut active: recovery_config::ActiveModel = config.into();
                active.activation_recovery_enabled =
                    Set(if activation_recovery_enabled { 1 } else { 0 });
                active.recovery_postcard_enabled = Set(if recovery_postcard_enabled { 1 } else { 0 });
                active.update(&self.db).await?;
            }
            None => {
                recovery_config::ActiveModel {
                    id: NotSet,
                    application_id: Set(application_id),
                    activation_recovery_enabled: Set(if activation_recovery_enabled { 1 } else { 0 }),
                    recovery_postcard_enabled: Set(if recovery_postcard_enabled { 1 } else { 0 }),
                }
                .insert(&self.db)
                .await?;
            }
        }
        self.get_recovery_config(application_id).await
    }
}

fn parse_code_status(value: &str) -> Result<RecoveryCodeStatus, ServiceError> {
    match value.to_ascii_uppercase().as_str() {
        "CREATED" => Ok(RecoveryCodeStatus::Created),
        "ACTIVE" => Ok(RecoveryCodeStatus::Active),
        "BLOCKED" => Ok(RecoveryCodeStatus::Blocked),
        "REVOKED" => Ok(RecoveryCodeStatus::Revoked),
        other => Err(ServiceError::InvalidRequest(format!(
            "unknown recovery code status: {other}"
        ))),
    }
}

async fn generate_unique_code<C: ConnectionTrait>(
    txn: &C,
    settings: &Settings,
    application_id: i64,
) -> Result<String, ServiceError> {
    for _ in 0..settings.crypto.generate_recovery_code_iterations {
        let candidate = codes::generate_code();
        if storage::find_recovery_code_by_code(txn, application_id, &candidate)
            .await?
            .is_none()
        {
            return Ok(candidate);
        }
    }
    Err(ServiceError::UnableToGenerateRecoveryCode)
}

async fn invalidate_remaining_puks<C: ConnectionTrait>(
    txn: &C,
    recovery_code_id: i64,
    now: i64,
) -> Result<(), ServiceError> {
    let puks = storage::list_recovery_puks(txn, recovery_code_id).await?;
    for puk in puks {
        if RecoveryPukStatus::from_db(puk.status) == Some(RecoveryPukStatus::Valid) {
            let mut active: recovery_puk::ActiveModel = puk.into();
            active.status = Set(RecoveryPukStatus::Invalid.to_db());
            active.timestamp_last_change = Set(Some(now));
            active.update(txn).await?;
        }
    }
    Ok(())
}

/// Issue an activation-bound recovery code during Prepare/Create when the
/// application has activation recovery enabled. Returns the plaintext code
/// and PUK for the sealed activation payload.
pub(crate) async fn issue_activation_recovery<C: ConnectionTrait>(
    txn: &C,
    settings: &Settings,
    application_id: i64,
    user_id: &str,
    activation_id: &str,
    now: i64,
) -> Result<Option<ActivationRecovery>, ServiceError> {
    let enabled = storage::find_recovery_config(txn, application_id)
        .await?
        .map(|config| config.activation_recovery_enabled != 0)
        .unwrap_or(false);
    if !enabled {
        return Ok(None);
    }

    let recovery_code = generate_unique_code(txn, settings, application_id).await?;
    let code_row = recovery_code::ActiveModel {
        id: NotSet,
        application_id: Set(application_id),
        user_id: Set(user_id.to_string()),
        activation_id: Set(Some(activation_id.to_string())),
        recovery_code: Set(recovery_code.clone()),
        status: Set(RecoveryCodeStatus::Active.to_db()),
        failed_attempts: Set(0),
        max_failed_attempts: Set(settings.recovery.max_failed_attempts),
        timestamp_created: Set(now),
        timestamp_last_used: Set(None),
    }
    .insert(txn)
    .await?;

    let puk = codes::generate_puk();
    recovery_puk::ActiveModel {
        id: NotSet,
        recovery_code_id: Set(code_row.id),
        puk_index: Set(1),
        puk_hash: Set(codes::hash_puk(&recovery_code, &puk)),
        status: Set(RecoveryPukStatus::Valid.to_db()),
        timestamp_last_change: Set(None),
    }
    .insert(txn)
    .await?;

    Ok(Some(ActivationRecovery { recovery_code, puk }))
}
