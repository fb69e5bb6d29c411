//! Activation lifecycle state machine.
//!
//! Init creates a CREATED record with freshly minted identifiers and server
//! key material; Prepare binds the device public key over the ECIES
//! envelope and moves to OTP_USED; Commit moves to ACTIVE. Block, Unblock
//! and Remove administer the record, and every read applies lazy expiration
//! to pending activations before any state check. Each transition is
//! persisted together with a history row in one transaction, and a
//! callback notification fires after commit.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use p256::SecretKey;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::applications::ApplicationService;
use crate::callbacks::{CallbackDispatcher, CallbackEvent};
use crate::clock::Clock;
use crate::crypto::ecies::{self, Envelope, EnvelopeKeys};
use crate::crypto::status_blob::{self, StatusBlob, PROTOCOL_VERSION};
use crate::crypto::{codes, keys};
use crate::entities::activation::{self, ActivationStatus};
use crate::errors::ServiceError;
use crate::key_at_rest::{EncryptionMode, KeyAtRestCodec};
use crate::recovery;
use crate::settings::Settings;
use crate::storage;

/// Reason recorded when an activation is blocked without an explicit one.
pub const BLOCKED_REASON_NOT_SPECIFIED: &str = "NOT_SPECIFIED";
/// Reason recorded when the failed-attempt threshold blocks an activation.
pub const BLOCKED_REASON_MAX_FAILED_ATTEMPTS: &str = "MAX_FAILED_ATTEMPTS";

#[derive(Clone)]
pub struct ActivationService {
    db: DatabaseConnection,
    settings: Arc<Settings>,
    codec: Arc<KeyAtRestCodec>,
    callbacks: CallbackDispatcher,
    clock: Clock,
    applications: ApplicationService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitActivationRequest {
    pub application_id: i64,
    pub user_id: String,
    #[serde(default)]
    pub max_failed_attempts: Option<i64>,
    /// Absolute expiration in epoch milliseconds; defaults to now + the
    /// configured activation validity window.
    #[serde(default)]
    pub timestamp_activation_expire: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitActivationResponse {
    pub activation_id: String,
    pub activation_code: String,
    pub activation_signature: String,
    pub user_id: String,
    pub application_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareActivationRequest {
    pub activation_code: String,
    pub application_key: String,
    #[serde(default)]
    pub activation_name: Option<String>,
    #[serde(default)]
    pub extras: Option<String>,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActivationRequest {
    pub application_key: String,
    pub user_id: String,
    #[serde(default)]
    pub max_failed_attempts: Option<i64>,
    #[serde(default)]
    pub timestamp_activation_expire: Option<i64>,
    #[serde(default)]
    pub activation_name: Option<String>,
    #[serde(default)]
    pub extras: Option<String>,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// ECIES-sealed response to Prepare and Create.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedActivationResponse {
    pub activation_id: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Plaintext payload carried inside [`EncryptedActivationResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationPayload {
    pub activation_id: String,
    pub server_public_key: String,
    pub device_public_key_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_recovery: Option<ActivationRecovery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRecovery {
    pub recovery_code: String,
    pub puk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitActivationResponse {
    pub activation_id: String,
    pub activated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetActivationStatusResponse {
    pub activation_id: String,
    pub activation_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_name: Option<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<String>,
    pub application_id: i64,
    pub timestamp_created: i64,
    pub timestamp_last_used: i64,
    pub encrypted_status_blob: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_public_key_fingerprint: Option<String>,
    /// Protocol version, 0 while unknown.
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockActivationResponse {
    pub activation_id: String,
    pub activation_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblockActivationResponse {
    pub activation_id: String,
    pub activation_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveActivationResponse {
    pub activation_id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationListItem {
    pub activation_id: String,
    pub activation_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<String>,
    pub user_id: String,
    pub application_id: i64,
    pub timestamp_created: i64,
    pub timestamp_last_used: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetActivationListResponse {
    pub user_id: String,
    pub activations: Vec<ActivationListItem>,
}

impl ActivationService {
    pub fn new(
        db: DatabaseConnection,
        settings: Arc<Settings>,
        codec: Arc<KeyAtRestCodec>,
        callbacks: CallbackDispatcher,
        clock: Clock,
        applications: ApplicationService,
    ) -> Self {
        Self {
            db,
            settings,
            codec,
            callbacks,
            clock,
            applications,
        }
    }

    fn emit(&self, events: Vec<CallbackEvent>) {
        for event in events {
            self.callbacks.notify(event.application_id, &event.activation_id);
        }
    }

    /// Initialize a new activation in CREATED state.
    pub async fn init(&self, request: &InitActivationRequest) -> Result<InitActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let (response, event) = self.init_in_txn(&txn, request, now).await?;
        txn.commit().await?;
        self.emit(vec![event]);
        Ok(response)
    }

    /// Init body reused by the recovery-code activation path, which runs it
    /// inside its own transaction.
    pub(crate) async fn init_in_txn<C: ConnectionTrait>(
        &self,
        txn: &C,
        request: &InitActivationRequest,
        now: i64,
    ) -> Result<(InitActivationResponse, CallbackEvent), ServiceError> {
        if request.user_id.is_empty() {
            return Err(ServiceError::NoUserId);
        }
        if request.application_id <= 0 {
            return Err(ServiceError::NoApplicationId);
        }

        let crypto = &self.settings.crypto;
        let max_failed_attempts = request
            .max_failed_attempts
            .unwrap_or(crypto.signature_max_failed_attempts);
        let timestamp_expire = request
            .timestamp_activation_expire
            .unwrap_or(now + crypto.activation_validity_ms);

        let master_key_pair = storage::find_current_master_key_pair(txn, request.application_id)
            .await?
            .ok_or_else(|| {
                error!(
                    application_id = request.application_id,
                    "no master key pair found for application"
                );
                ServiceError::NoMasterKeyPair
            })?;
        let master_private = keys::private_key_from_base64(&master_key_pair.master_key_private)
            .map_err(|_| {
                error!(
                    application_id = request.application_id,
                    "master private key is invalid"
                );
                ServiceError::IncorrectMasterKeyPairPrivate
            })?;

        // Mint a unique activation ID, retrying on collisions.
        let mut activation_id = None;
        for _ in 0..crypto.generate_activation_id_iterations {
            let candidate = codes::generate_activation_id();
            if storage::find_activation(txn, &candidate).await?.is_none() {
                activation_id = Some(candidate);
                break;
            }
        }
        let activation_id = activation_id.ok_or(ServiceError::UnableToGenerateActivationId)?;

        // Mint an activation code unique among pending, unexpired
        // activations of the application.
        let pending = [ActivationStatus::Created, ActivationStatus::OtpUsed];
        let mut activation_code = None;
        for _ in 0..crypto.generate_activation_code_iterations {
            let candidate = codes::generate_code();
            let collision = storage::find_activation_by_code_for_update(
                txn,
                request.application_id,
                &candidate,
                &pending,
                now,
            )
            .await?;
            if collision.is_none() {
                activation_code = Some(candidate);
                break;
            }
        }
        let activation_code = activation_code.ok_or(ServiceError::UnableToGenerateActivationCode)?;

        let activation_signature = keys::sign_activation_code(&activation_code, &master_private);
        let server_key_pair = keys::generate_key_pair();
        let private_bytes = server_key_pair.private.to_bytes();
        let (encryption_mode, server_private_key) =
            self.codec
                .encode(private_bytes.as_slice(), &request.user_id, &activation_id);

        let record = activation::ActiveModel {
            activation_id: Set(activation_id.clone()),
            activation_code: Set(activation_code.clone()),
            activation_name: Set(None),
            extras: Set(None),
            user_id: Set(request.user_id.clone()),
            application_id: Set(request.application_id),
            master_key_pair_id: Set(master_key_pair.id),
            server_public_key: Set(keys::public_key_to_base64(&server_key_pair.public)),
            server_private_key: Set(server_private_key),
            server_private_key_encryption: Set(encryption_mode.to_db()),
            device_public_key: Set(None),
            counter: Set(0),
            failed_attempts: Set(0),
            max_failed_attempts: Set(max_failed_attempts),
            status: Set(ActivationStatus::Created.to_db()),
            blocked_reason: Set(None),
            timestamp_created: Set(now),
            timestamp_last_used: Set(now),
            timestamp_activation_expire: Set(timestamp_expire),
            version: Set(None),
        };
        record.insert(txn).await?;
        storage::insert_activation_history(txn, &activation_id, ActivationStatus::Created, now).await?;

        info!(activation_id = %activation_id, user_id = %request.user_id, "activation initialized");

        Ok((
            InitActivationResponse {
                activation_id: activation_id.clone(),
                activation_code,
                activation_signature: Base64::encode_string(&activation_signature),
                user_id: request.user_id.clone(),
                application_id: request.application_id,
            },
            CallbackEvent {
                application_id: request.application_id,
                activation_id,
            },
        ))
    }

    /// Bind the device public key delivered in the ECIES envelope and move
    /// the activation from CREATED to OTP_USED.
    pub async fn prepare(
        &self,
        request: &PrepareActivationRequest,
    ) -> Result<EncryptedActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let credentials = self
            .applications
            .lookup_credentials(&request.application_key)
            .await?
            .ok_or_else(|| ServiceError::InvalidRequest("unknown application key".into()))?;
        if !credentials.supported {
            return Err(ServiceError::InvalidRequest(
                "application version is not supported".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let activation = storage::find_activation_by_code_for_update(
            &txn,
            credentials.application_id,
            &request.activation_code,
            &[ActivationStatus::Created],
            now,
        )
        .await?
        .ok_or(ServiceError::ActivationNotFound)?;

        let master_key_pair = storage::find_master_key_pair(&txn, activation.master_key_pair_id)
            .await?
            .ok_or(ServiceError::NoMasterKeyPair)?;
        let master_private = keys::private_key_from_base64(&master_key_pair.master_key_private)
            .map_err(|_| ServiceError::IncorrectMasterKeyPairPrivate)?;

        // An envelope that fails to open, or a payload that is not a valid
        // point, is indistinguishable from a non-existent activation; the
        // record is burned in the same transaction.
        let opened = open_device_key(
            &request.envelope,
            &master_private,
            &credentials.application_secret,
        );
        let (device_public, envelope_keys) = match opened {
            Ok(opened) => opened,
            Err(_) => {
                let activation_id = activation.activation_id.clone();
                let application_id = activation.application_id;
                remove_in_txn(&txn, activation, now).await?;
                txn.commit().await?;
                self.emit(vec![CallbackEvent {
                    application_id,
                    activation_id,
                }]);
                return Err(ServiceError::ActivationNotFound);
            }
        };

        let activation_id = activation.activation_id.clone();
        let application_id = activation.application_id;
        let server_public = keys::public_key_from_base64(&activation.server_public_key)?;

        let mut active: activation::ActiveModel = activation.into();
        active.device_public_key = Set(Some(keys::public_key_to_base64(&device_public)));
        active.activation_name = Set(request.activation_name.clone());
        active.extras = Set(request.extras.clone());
        active.status = Set(ActivationStatus::OtpUsed.to_db());
        active.version = Set(Some(PROTOCOL_VERSION as i64));
        let updated = active.update(&txn).await?;
        storage::insert_activation_history(&txn, &activation_id, ActivationStatus::OtpUsed, now).await?;

        let activation_recovery = recovery::issue_activation_recovery(
            &txn,
            &self.settings,
            application_id,
            &updated.user_id,
            &activation_id,
            now,
        )
        .await?;

        let payload = ActivationPayload {
            activation_id: activation_id.clone(),
            server_public_key: updated.server_public_key.clone(),
            device_public_key_fingerprint: keys::device_fingerprint(
                &device_public,
                &activation_id,
                &server_public,
            ),
            activation_recovery,
        };
        let sealed = ecies::seal_with_keys(&envelope_keys, &serde_json::to_vec(&payload)?);

        txn.commit().await?;
        self.emit(vec![CallbackEvent {
            application_id,
            activation_id: activation_id.clone(),
        }]);
        info!(activation_id = %activation_id, "activation prepared");

        Ok(EncryptedActivationResponse {
            activation_id,
            envelope: sealed,
        })
    }

    /// Server-initiated activation: Init and device-key binding in a single
    /// transaction, driven by the caller's identity assertion.
    pub async fn create(
        &self,
        request: &CreateActivationRequest,
    ) -> Result<EncryptedActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let credentials = self
            .applications
            .lookup_credentials(&request.application_key)
            .await?
            .ok_or_else(|| ServiceError::InvalidRequest("unknown application key".into()))?;
        if !credentials.supported {
            return Err(ServiceError::InvalidRequest(
                "application version is not supported".into(),
            ));
        }

        let init_request = InitActivationRequest {
            application_id: credentials.application_id,
            user_id: request.user_id.clone(),
            max_failed_attempts: request.max_failed_attempts,
            timestamp_activation_expire: request.timestamp_activation_expire,
        };

        let txn = self.db.begin().await?;
        let (init_response, event) = self.init_in_txn(&txn, &init_request, now).await?;
        let activation = storage::find_activation(&txn, &init_response.activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;

        let master_key_pair = storage::find_master_key_pair(&txn, activation.master_key_pair_id)
            .await?
            .ok_or(ServiceError::NoMasterKeyPair)?;
        let master_private = keys::private_key_from_base64(&master_key_pair.master_key_private)
            .map_err(|_| ServiceError::IncorrectMasterKeyPairPrivate)?;

        let (device_public, envelope_keys) = open_device_key(
            &request.envelope,
            &master_private,
            &credentials.application_secret,
        )?;

        let activation_id = activation.activation_id.clone();
        let application_id = activation.application_id;
        let server_public = keys::public_key_from_base64(&activation.server_public_key)?;

        let mut active: activation::ActiveModel = activation.into();
        active.device_public_key = Set(Some(keys::public_key_to_base64(&device_public)));
        active.activation_name = Set(request.activation_name.clone());
        active.extras = Set(request.extras.clone());
        active.status = Set(ActivationStatus::OtpUsed.to_db());
        active.version = Set(Some(PROTOCOL_VERSION as i64));
        let updated = active.update(&txn).await?;
        storage::insert_activation_history(&txn, &activation_id, ActivationStatus::OtpUsed, now).await?;

        let activation_recovery = recovery::issue_activation_recovery(
            &txn,
            &self.settings,
            application_id,
            &updated.user_id,
            &activation_id,
            now,
        )
        .await?;

        let payload = ActivationPayload {
            activation_id: activation_id.clone(),
            server_public_key: updated.server_public_key.clone(),
            device_public_key_fingerprint: keys::device_fingerprint(
                &device_public,
                &activation_id,
                &server_public,
            ),
            activation_recovery,
        };
        let sealed = ecies::seal_with_keys(&envelope_keys, &serde_json::to_vec(&payload)?);

        txn.commit().await?;
        self.emit(vec![event]);
        info!(activation_id = %activation_id, "activation created");

        Ok(EncryptedActivationResponse {
            activation_id,
            envelope: sealed,
        })
    }

    /// Move an OTP_USED activation to ACTIVE.
    pub async fn commit(&self, activation_id: &str) -> Result<CommitActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let activation = storage::find_activation_for_update(&txn, activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;

        let (activation, expired_event) = expire_pending_in_txn(&txn, activation, now).await?;
        if let Some(event) = expired_event {
            // The expiry transition must survive even though commit fails.
            txn.commit().await?;
            self.emit(vec![event]);
            return Err(ServiceError::ActivationExpired);
        }

        match activation.activation_status() {
            ActivationStatus::OtpUsed => {
                let application_id = activation.application_id;
                let mut active: activation::ActiveModel = activation.into();
                active.status = Set(ActivationStatus::Active.to_db());
                active.update(&txn).await?;
                storage::insert_activation_history(&txn, activation_id, ActivationStatus::Active, now)
                    .await?;
                txn.commit().await?;
                self.emit(vec![CallbackEvent {
                    application_id,
                    activation_id: activation_id.to_string(),
                }]);
                info!(activation_id = %activation_id, "activation committed");
                Ok(CommitActivationResponse {
                    activation_id: activation_id.to_string(),
                    activated: true,
                })
            }
            ActivationStatus::Removed => Err(ServiceError::ActivationExpired),
            _ => Err(ServiceError::ActivationIncorrectState),
        }
    }

    /// Block an ACTIVE activation; any other state is reported back
    /// unchanged.
    pub async fn block(
        &self,
        activation_id: &str,
        reason: Option<String>,
    ) -> Result<BlockActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let activation = storage::find_activation_for_update(&txn, activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;

        match activation.activation_status() {
            ActivationStatus::Active => {
                let application_id = activation.application_id;
                let blocked_reason =
                    Some(reason.unwrap_or_else(|| BLOCKED_REASON_NOT_SPECIFIED.to_string()));
                let mut active: activation::ActiveModel = activation.into();
                active.status = Set(ActivationStatus::Blocked.to_db());
                active.blocked_reason = Set(blocked_reason.clone());
                active.update(&txn).await?;
                storage::insert_activation_history(&txn, activation_id, ActivationStatus::Blocked, now)
                    .await?;
                txn.commit().await?;
                self.emit(vec![CallbackEvent {
                    application_id,
                    activation_id: activation_id.to_string(),
                }]);
                Ok(BlockActivationResponse {
                    activation_id: activation_id.to_string(),
                    activation_status: ActivationStatus::Blocked.as_str().to_string(),
                    blocked_reason,
                })
            }
            status => Ok(BlockActivationResponse {
                activation_id: activation_id.to_string(),
                activation_status: status.as_str().to_string(),
                blocked_reason: activation.blocked_reason.clone(),
            }),
        }
    }

    /// Unblock a BLOCKED activation, clearing the failure count; any other
    /// state is reported back unchanged.
    pub async fn unblock(&self, activation_id: &str) -> Result<UnblockActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let activation = storage::find_activation_for_update(&txn, activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;

        match activation.activation_status() {
            ActivationStatus::Blocked => {
                let application_id = activation.application_id;
                let mut active: activation::ActiveModel = activation.into();
                active.status = Set(ActivationStatus::Active.to_db());
                active.blocked_reason = Set(None);
                active.failed_attempts = Set(0);
                active.update(&txn).await?;
                storage::insert_activation_history(&txn, activation_id, ActivationStatus::Active, now)
                    .await?;
                txn.commit().await?;
                self.emit(vec![CallbackEvent {
                    application_id,
                    activation_id: activation_id.to_string(),
                }]);
                Ok(UnblockActivationResponse {
                    activation_id: activation_id.to_string(),
                    activation_status: ActivationStatus::Active.as_str().to_string(),
                })
            }
            status => Ok(UnblockActivationResponse {
                activation_id: activation_id.to_string(),
                activation_status: status.as_str().to_string(),
            }),
        }
    }

    /// Remove an activation from any state; removing a removed activation
    /// is a no-op success.
    pub async fn remove(&self, activation_id: &str) -> Result<RemoveActivationResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let activation = storage::find_activation_for_update(&txn, activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;

        if activation.activation_status() == ActivationStatus::Removed {
            return Ok(RemoveActivationResponse {
                activation_id: activation_id.to_string(),
                removed: true,
            });
        }

        let application_id = activation.application_id;
        remove_in_txn(&txn, activation, now).await?;
        txn.commit().await?;
        self.emit(vec![CallbackEvent {
            application_id,
            activation_id: activation_id.to_string(),
        }]);
        info!(activation_id = %activation_id, "activation removed");
        Ok(RemoveActivationResponse {
            activation_id: activation_id.to_string(),
            removed: true,
        })
    }

    /// Report activation status to the device. Unknown activations are
    /// synthesized as REMOVED with a fresh random blob so existence cannot
    /// be probed.
    pub async fn get_status(
        &self,
        activation_id: &str,
    ) -> Result<GetActivationStatusResponse, ServiceError> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let Some(activation) = storage::find_activation(&txn, activation_id).await? else {
            txn.commit().await?;
            return Ok(unknown_activation_status(activation_id));
        };

        let (activation, expired_event) = expire_pending_in_txn(&txn, activation, now).await?;

        let response = match activation.activation_status() {
            ActivationStatus::Created => {
                // No device key yet, so no transport key can exist; the code
                // and a fresh issuance signature are re-served for retry.
                let master_key_pair =
                    storage::find_current_master_key_pair(&txn, activation.application_id)
                        .await?
                        .ok_or(ServiceError::NoMasterKeyPair)?;
                let master_private =
                    keys::private_key_from_base64(&master_key_pair.master_key_private)
                        .map_err(|_| ServiceError::IncorrectMasterKeyPairPrivate)?;
                let signature = keys::sign_activation_code(&activation.activation_code, &master_private);
                GetActivationStatusResponse {
                    activation_id: activation.activation_id.clone(),
                    activation_status: ActivationStatus::Created.as_str().to_string(),
                    blocked_reason: None,
                    activation_name: activation.activation_name.clone(),
                    user_id: activation.user_id.clone(),
                    extras: activation.extras.clone(),
                    application_id: activation.application_id,
                    timestamp_created: activation.timestamp_created,
                    timestamp_last_used: activation.timestamp_last_used,
                    encrypted_status_blob: Base64::encode_string(&status_blob::random_status_blob()),
                    activation_code: Some(activation.activation_code.clone()),
                    activation_signature: Some(Base64::encode_string(&signature)),
                    device_public_key_fingerprint: None,
                    version: activation.version.unwrap_or(0),
                }
            }
            status => {
                // A device key exists unless the record was burned straight
                // out of CREATED; without one the blob stays random.
                let mut encrypted_status_blob = status_blob::random_status_blob();
                let mut fingerprint = None;
                if let Some(device_public_b64) = &activation.device_public_key {
                    let device_public = keys::public_key_from_base64(device_public_b64)?;
                    let server_public = keys::public_key_from_base64(&activation.server_public_key)?;
                    let mode = EncryptionMode::from_db(activation.server_private_key_encryption)
                        .ok_or_else(|| {
                            ServiceError::GenericCryptography("unknown key encryption mode".into())
                        })?;
                    let private_bytes = self.codec.decode(
                        mode,
                        &activation.server_private_key,
                        &activation.user_id,
                        &activation.activation_id,
                    )?;
                    let server_private = keys::private_key_from_bytes(&private_bytes)?;
                    let master_secret = keys::shared_master_secret(&server_private, &device_public);
                    let transport_key = keys::derive_key(&master_secret, keys::KDF_TRANSPORT);
                    let blob = StatusBlob {
                        status: status.to_db() as u8,
                        current_version: activation.version.unwrap_or(0) as u8,
                        upgrade_version: PROTOCOL_VERSION,
                        failed_attempts: activation.failed_attempts as u8,
                        max_failed_attempts: activation.max_failed_attempts as u8,
                        counter_distance: 0,
                    };
                    encrypted_status_blob = status_blob::encrypt_status_blob(
                        &blob,
                        &transport_key,
                        activation.counter as u64,
                    );
                    fingerprint = Some(keys::device_fingerprint(
                        &device_public,
                        &activation.activation_id,
                        &server_public,
                    ));
                }
                GetActivationStatusResponse {
                    activation_id: activation.activation_id.clone(),
                    activation_status: status.as_str().to_string(),
                    blocked_reason: activation.blocked_reason.clone(),
                    activation_name: activation.activation_name.clone(),
                    user_id: activation.user_id.clone(),
                    extras: activation.extras.clone(),
                    application_id: activation.application_id,
                    timestamp_created: activation.timestamp_created,
                    timestamp_last_used: activation.timestamp_last_used,
                    encrypted_status_blob: Base64::encode_string(&encrypted_status_blob),
                    activation_code: None,
                    activation_signature: None,
                    device_public_key_fingerprint: fingerprint,
                    version: activation.version.unwrap_or(0),
                }
            }
        };

        txn.commit().await?;
        if let Some(event) = expired_event {
            self.emit(vec![event]);
        }
        Ok(response)
    }

    /// Activations of one user, optionally narrowed to an application, with
    /// lazy expiration applied.
    pub async fn get_activation_list(
        &self,
        application_id: Option<i64>,
        user_id: &str,
    ) -> Result<GetActivationListResponse, ServiceError> {
        if user_id.is_empty() {
            return Err(ServiceError::NoUserId);
        }
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let activations = storage::find_activations_for_user(&txn, application_id, user_id).await?;
        let mut items = Vec::with_capacity(activations.len());
        let mut events = Vec::new();
        for activation in activations {
            let (activation, expired_event) = expire_pending_in_txn(&txn, activation, now).await?;
            events.extend(expired_event);
            items.push(ActivationListItem {
                activation_id: activation.activation_id.clone(),
                activation_status: activation.activation_status().as_str().to_string(),
                blocked_reason: activation.blocked_reason.clone(),
                activation_name: activation.activation_name.clone(),
                extras: activation.extras.clone(),
                user_id: activation.user_id.clone(),
                application_id: activation.application_id,
                timestamp_created: activation.timestamp_created,
                timestamp_last_used: activation.timestamp_last_used,
            });
        }
        txn.commit().await?;
        self.emit(events);
        Ok(GetActivationListResponse {
            user_id: user_id.to_string(),
            activations: items,
        })
    }

    /// Bulk expiry sweep for the background job; applies the same REMOVED
    /// transition as request-path lazy expiration.
    pub async fn expire_pending_activations(&self) -> Result<u64, ServiceError> {
        let now = self.clock.now_ms();
        let mut total = 0u64;
        loop {
            let txn = self.db.begin().await?;
            let batch = storage::find_expired_pending_activations(&txn, now, 100).await?;
            if batch.is_empty() {
                txn.commit().await?;
                break;
            }
            let mut events = Vec::with_capacity(batch.len());
            for activation in batch {
                let activation_id = activation.activation_id.clone();
                let application_id = activation.application_id;
                remove_in_txn(&txn, activation, now).await?;
                events.push(CallbackEvent {
                    application_id,
                    activation_id,
                });
                total += 1;
            }
            txn.commit().await?;
            self.emit(events);
        }
        Ok(total)
    }
}

/// Decrypt and validate the device public key from a request envelope.
fn open_device_key(
    envelope: &Envelope,
    master_private: &SecretKey,
    application_secret: &str,
) -> Result<(p256::PublicKey, EnvelopeKeys), ServiceError> {
    let (plaintext, envelope_keys) = ecies::open_request(envelope, master_private, application_secret)?;
    let device_public = keys::public_key_from_bytes(&plaintext)?;
    Ok((device_public, envelope_keys))
}

/// Transition a pending activation to REMOVED when its expiration window
/// has passed. Returns the (possibly updated) record and the callback event
/// to emit after commit.
pub(crate) async fn expire_pending_in_txn<C: ConnectionTrait>(
    txn: &C,
    activation: activation::Model,
    now: i64,
) -> Result<(activation::Model, Option<CallbackEvent>), ServiceError> {
    let status = activation.activation_status();
    if status.is_pending() && now > activation.timestamp_activation_expire {
        let activation_id = activation.activation_id.clone();
        let application_id = activation.application_id;
        let updated = remove_in_txn(txn, activation, now).await?;
        return Ok((
            updated,
            Some(CallbackEvent {
                application_id,
                activation_id,
            }),
        ));
    }
    Ok((activation, None))
}

async fn remove_in_txn<C: ConnectionTrait>(
    txn: &C,
    activation: activation::Model,
    now: i64,
) -> Result<activation::Model, ServiceError> {
    let activation_id = activation.activation_id.clone();
    let mut active: activation::ActiveModel = activation.into();
    active.status = Set(ActivationStatus::Removed.to_db());
    let updated = active.update(txn).await?;
    storage::insert_activation_history(txn, &activation_id, ActivationStatus::Removed, now).await?;
    Ok(updated)
}

/// Synthesized status for activations that do not exist: REMOVED shape,
/// sentinel identifiers, epoch timestamps and a fresh random blob.
fn unknown_activation_status(activation_id: &str) -> GetActivationStatusResponse {
    GetActivationStatusResponse {
        activation_id: activation_id.to_string(),
        activation_status: ActivationStatus::Removed.as_str().to_string(),
        blocked_reason: None,
        activation_name: Some("unknown".to_string()),
        user_id: "unknown".to_string(),
        extras: None,
        application_id: 0,
        timestamp_created: 0,
        timestamp_last_used: 0,
        encrypted_status_blob: Base64::encode_string(&status_blob::random_status_blob()),
        activation_code: None,
        activation_signature: None,
        device_public_key_fingerprint: None,
        version: 0,
    }
}
