//! Online and offline signature verification.
//!
//! The verifier recomputes the expected signature at every counter offset
//! within the lookahead window and compares in constant time. A match
//! advances the counter past the matched offset and clears the failure
//! count; a miss increments it and blocks the activation at the threshold.
//! Every attempt leaves a signature-audit row.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::activations::{expire_pending_in_txn, BLOCKED_REASON_MAX_FAILED_ATTEMPTS};
use crate::applications::ApplicationService;
use crate::callbacks::{CallbackDispatcher, CallbackEvent};
use crate::clock::Clock;
use crate::crypto::keys;
use crate::crypto::signature::{
    compute_signature, derive_factor_keys, signatures_match, SignatureType,
    OFFLINE_APPLICATION_SECRET,
};
use crate::crypto::status_blob::PROTOCOL_VERSION;
use crate::entities::activation::{self, ActivationStatus};
use crate::errors::ServiceError;
use crate::key_at_rest::{EncryptionMode, KeyAtRestCodec};
use crate::settings::Settings;
use crate::storage;

#[derive(Clone)]
pub struct SignatureService {
    db: DatabaseConnection,
    settings: Arc<Settings>,
    codec: Arc<KeyAtRestCodec>,
    callbacks: CallbackDispatcher,
    clock: Clock,
    applications: ApplicationService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySignatureRequest {
    pub activation_id: String,
    /// Canonicalized request payload the device signed.
    pub data: String,
    pub signature: String,
    pub signature_type: String,
    pub application_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOfflineSignatureRequest {
    pub activation_id: String,
    pub data: String,
    pub signature: String,
    #[serde(default)]
    pub signature_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySignatureResponse {
    pub signature_valid: bool,
    pub activation_id: String,
    pub activation_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<i64>,
    pub remaining_attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSignaturePayloadResponse {
    /// `data\nnonce\nsignature`, rendered into the offline QR code.
    pub offline_data: String,
    pub nonce: String,
}

fn data_hash(data: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(data))
}

impl SignatureService {
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

    /// Verify an online request signature.
    pub async fn verify(
        &self,
        request: &VerifySignatureRequest,
    ) -> Result<VerifySignatureResponse, ServiceError> {
        let signature_type = SignatureType::from_str(&request.signature_type)?;
        self.verify_core(
            &request.activation_id,
            request.data.as_bytes(),
            &request.signature,
            signature_type,
            Some(&request.application_key),
        )
        .await
    }

    /// Verify an offline (QR-code) signature; defaults to the two-factor
    /// possession + knowledge type and needs no application context.
    pub async fn verify_offline(
        &self,
        request: &VerifyOfflineSignatureRequest,
    ) -> Result<VerifySignatureResponse, ServiceError> {
        let signature_type = match &request.signature_type {
            Some(value) => SignatureType::from_str(value)?,
            None => SignatureType::PossessionKnowledge,
        };
        self.verify_core(
            &request.activation_id,
            request.data.as_bytes(),
            &request.signature,
            signature_type,
            None,
        )
        .await
    }

    async fn verify_core(
        &self,
        activation_id: &str,
        data: &[u8],
        provided_signature: &str,
        signature_type: SignatureType,
        application_key: Option<&str>,
    ) -> Result<VerifySignatureResponse, ServiceError> {
        let now = self.clock.now_ms();
        let hash = data_hash(data);

        let txn = self.db.begin().await?;
        let Some(found) = storage::find_activation_for_update(&txn, activation_id).await? else {
            txn.commit().await?;
            return Ok(VerifySignatureResponse {
                signature_valid: false,
                activation_id: activation_id.to_string(),
                activation_status: ActivationStatus::Removed.as_str().to_string(),
                blocked_reason: None,
                user_id: None,
                application_id: None,
                remaining_attempts: 0,
            });
        };

        let (activation, expired_event) = expire_pending_in_txn(&txn, found, now).await?;
        let status = activation.activation_status();

        if !matches!(status, ActivationStatus::Active | ActivationStatus::Blocked) {
            storage::insert_signature_audit(
                &txn,
                activation_id,
                activation.counter,
                status,
                signature_type.as_str(),
                &hash,
                false,
                Some(format!("activation state {} rejects signatures", status.as_str())),
                now,
            )
            .await?;
            let response = invalid_response(&activation, 0);
            txn.commit().await?;
            self.emit(expired_event.into_iter().collect());
            return Ok(response);
        }

        // Resolve the application secret; a key/application mismatch is
        // rejected without touching counters.
        let application_secret = match application_key {
            Some(key) => {
                let credentials = self.applications.lookup_credentials(key).await?;
                match credentials {
                    Some(credentials)
                        if credentials.application_id == activation.application_id
                            && credentials.supported =>
                    {
                        credentials.application_secret
                    }
                    _ => {
                        storage::insert_signature_audit(
                            &txn,
                            activation_id,
                            activation.counter,
                            status,
                            signature_type.as_str(),
                            &hash,
                            false,
                            Some("application key mismatch".to_string()),
                            now,
                        )
                        .await?;
                        let remaining =
                            (activation.max_failed_attempts - activation.failed_attempts).max(0);
                        let response = invalid_response(&activation, remaining);
                        txn.commit().await?;
                        return Ok(response);
                    }
                }
            }
            None => OFFLINE_APPLICATION_SECRET.to_string(),
        };

        let mode = EncryptionMode::from_db(activation.server_private_key_encryption)
            .ok_or_else(|| ServiceError::GenericCryptography("unknown key encryption mode".into()))?;
        let private_bytes = self.codec.decode(
            mode,
            &activation.server_private_key,
            &activation.user_id,
            &activation.activation_id,
        )?;
        let server_private = keys::private_key_from_bytes(&private_bytes)?;
        let device_public_b64 = activation
            .device_public_key
            .as_deref()
            .ok_or_else(|| ServiceError::GenericCryptography("activation has no device key".into()))?;
        let device_public = keys::public_key_from_base64(device_public_b64)?;
        let master_secret = keys::shared_master_secret(&server_private, &device_public);
        let factor_keys = derive_factor_keys(&master_secret, signature_type);

        let lookahead = self.settings.crypto.signature_validation_lookahead;
        let counter = activation.counter as u64;
        let mut matched_offset = None;
        if status == ActivationStatus::Active {
            for offset in 0..=lookahead {
                let expected =
                    compute_signature(&factor_keys, counter + offset, data, &application_secret);
                if signatures_match(&expected, provided_signature) {
                    matched_offset = Some(offset);
                    break;
                }
            }
        }

        match matched_offset {
            Some(offset) => {
                let pre_counter = activation.counter;
                let new_counter = pre_counter + offset as i64 + 1;
                let max_failed_attempts = activation.max_failed_attempts;
                let version = activation.version.unwrap_or(0).max(PROTOCOL_VERSION as i64);
                let response_template = activation.clone();
                let mut active: activation::ActiveModel = activation.into();
                active.counter = Set(new_counter);
                active.failed_attempts = Set(0);
                active.timestamp_last_used = Set(now);
                active.version = Set(Some(version));
                active.update(&txn).await?;
                storage::insert_signature_audit(
                    &txn,
                    activation_id,
                    pre_counter,
                    ActivationStatus::Active,
                    signature_type.as_str(),
                    &hash,
                    true,
                    None,
                    now,
                )
                .await?;
                txn.commit().await?;
                Ok(VerifySignatureResponse {
                    signature_valid: true,
                    activation_id: activation_id.to_string(),
                    activation_status: ActivationStatus::Active.as_str().to_string(),
                    blocked_reason: None,
                    user_id: Some(response_template.user_id),
                    application_id: Some(response_template.application_id),
                    remaining_attempts: max_failed_attempts,
                })
            }
            None => {
                // BLOCKED activations never advance counters or accumulate
                // further failures; they only audit the attempt.
                if status == ActivationStatus::Blocked {
                    storage::insert_signature_audit(
                        &txn,
                        activation_id,
                        activation.counter,
                        status,
                        signature_type.as_str(),
                        &hash,
                        false,
                        Some("activation is blocked".to_string()),
                        now,
                    )
                    .await?;
                    let mut active: activation::ActiveModel = activation.clone().into();
                    active.timestamp_last_used = Set(now);
                    active.update(&txn).await?;
                    let response = invalid_response(&activation, 0);
                    txn.commit().await?;
                    return Ok(response);
                }

                let pre_counter = activation.counter;
                let failed_attempts = activation.failed_attempts + 1;
                let max_failed_attempts = activation.max_failed_attempts;
                let blocks = failed_attempts >= max_failed_attempts;
                let application_id = activation.application_id;
                let user_id = activation.user_id.clone();
                let mut active: activation::ActiveModel = activation.into();
                active.failed_attempts = Set(failed_attempts);
                active.timestamp_last_used = Set(now);
                let (response_status, blocked_reason) = if blocks {
                    active.status = Set(ActivationStatus::Blocked.to_db());
                    active.blocked_reason =
                        Set(Some(BLOCKED_REASON_MAX_FAILED_ATTEMPTS.to_string()));
                    (
                        ActivationStatus::Blocked,
                        Some(BLOCKED_REASON_MAX_FAILED_ATTEMPTS.to_string()),
                    )
                } else {
                    (ActivationStatus::Active, None)
                };
                active.update(&txn).await?;
                if blocks {
                    storage::insert_activation_history(
                        &txn,
                        activation_id,
                        ActivationStatus::Blocked,
                        now,
                    )
                    .await?;
                    info!(activation_id = %activation_id, "activation blocked after failed signatures");
                }
                storage::insert_signature_audit(
                    &txn,
                    activation_id,
                    pre_counter,
                    response_status,
                    signature_type.as_str(),
                    &hash,
                    false,
                    None,
                    now,
                )
                .await?;
                txn.commit().await?;
                if blocks {
                    self.emit(vec![CallbackEvent {
                        application_id,
                        activation_id: activation_id.to_string(),
                    }]);
                }
                Ok(VerifySignatureResponse {
                    signature_valid: false,
                    activation_id: activation_id.to_string(),
                    activation_status: response_status.as_str().to_string(),
                    blocked_reason,
                    user_id: Some(user_id),
                    application_id: Some(application_id),
                    remaining_attempts: (max_failed_attempts - failed_attempts).max(0),
                })
            }
        }
    }

    /// Offline payload signed by the activation's server private key.
    pub async fn create_personalized_offline_payload(
        &self,
        activation_id: &str,
        data: &str,
    ) -> Result<OfflineSignaturePayloadResponse, ServiceError> {
        let activation = storage::find_activation(&self.db, activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;
        let mode = EncryptionMode::from_db(activation.server_private_key_encryption)
            .ok_or_else(|| ServiceError::GenericCryptography("unknown key encryption mode".into()))?;
        let private_bytes = self.codec.decode(
            mode,
            &activation.server_private_key,
            &activation.user_id,
            &activation.activation_id,
        )?;
        let server_private = keys::private_key_from_bytes(&private_bytes)?;
        Ok(build_offline_payload(data, &server_private))
    }

    /// Offline payload signed by the application's current master key pair.
    pub async fn create_non_personalized_offline_payload(
        &self,
        application_id: i64,
        data: &str,
    ) -> Result<OfflineSignaturePayloadResponse, ServiceError> {
        let master_key_pair = storage::find_current_master_key_pair(&self.db, application_id)
            .await?
            .ok_or(ServiceError::NoMasterKeyPair)?;
        let master_private = keys::private_key_from_base64(&master_key_pair.master_key_private)
            .map_err(|_| ServiceError::IncorrectMasterKeyPairPrivate)?;
        Ok(build_offline_payload(data, &master_private))
    }

    fn emit(&self, events: Vec<CallbackEvent>) {
        for event in events {
            self.callbacks.notify(event.application_id, &event.activation_id);
        }
    }
}

fn invalid_response(activation: &activation::Model, remaining_attempts: i64) -> VerifySignatureResponse {
    VerifySignatureResponse {
        signature_valid: false,
        activation_id: activation.activation_id.clone(),
        activation_status: activation.activation_status().as_str().to_string(),
        blocked_reason: activation.blocked_reason.clone(),
        user_id: Some(activation.user_id.clone()),
        application_id: Some(activation.application_id),
        remaining_attempts,
    }
}

fn build_offline_payload(data: &str, signing_key: &p256::SecretKey) -> OfflineSignaturePayloadResponse {
    let mut nonce = [0u8; 16];
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let nonce_b64 = Base64::encode_string(&nonce);
    let signed_part = format!("{data}\n{nonce_b64}");
    let signature = keys::sign_data(signed_part.as_bytes(), signing_key);
    OfflineSignaturePayloadResponse {
        offline_data: format!("{signed_part}\n{}", Base64::encode_string(&signature)),
        nonce: nonce_b64,
    }
}
