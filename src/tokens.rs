//! Token credentials for lightweight request authentication.
//!
//! A token is issued over an ECIES envelope keyed by the activation's server
//! key material and validated by recomputing the HMAC digest of
//! `nonce & timestamp` under the token secret within a freshness window.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::applications::ApplicationService;
use crate::clock::Clock;
use crate::crypto::ecies::{self, Envelope};
use crate::crypto::keys;
use crate::crypto::signature::SignatureType;
use crate::entities::activation::ActivationStatus;
use crate::entities::token;
use crate::errors::ServiceError;
use crate::key_at_rest::{EncryptionMode, KeyAtRestCodec};
use crate::settings::Settings;
use crate::storage;

#[derive(Clone)]
pub struct TokenService {
    db: DatabaseConnection,
    settings: Arc<Settings>,
    codec: Arc<KeyAtRestCodec>,
    clock: Clock,
    applications: ApplicationService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    pub activation_id: String,
    pub application_key: String,
    pub signature_type: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenResponse {
    pub activation_id: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Plaintext payload sealed inside [`CreateTokenResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub token_id: String,
    pub token_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenRequest {
    pub token_id: String,
    /// Base64 HMAC-SHA256 of `nonce & timestamp` under the token secret.
    pub token_digest: String,
    pub nonce: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenResponse {
    pub token_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveTokenResponse {
    pub token_id: String,
    pub removed: bool,
}

fn invalid_token() -> ValidateTokenResponse {
    ValidateTokenResponse {
        token_valid: false,
        activation_id: None,
        user_id: None,
        application_id: None,
        signature_type: None,
    }
}

impl TokenService {
    pub fn new(
        db: DatabaseConnection,
        settings: Arc<Settings>,
        codec: Arc<KeyAtRestCodec>,
        clock: Clock,
        applications: ApplicationService,
    ) -> Self {
        Self {
            db,
            settings,
            codec,
            clock,
            applications,
        }
    }

    /// Issue a token for an ACTIVE activation, sealed to the requesting
    /// device.
    pub async fn create_token(
        &self,
        request: &CreateTokenRequest,
    ) -> Result<CreateTokenResponse, ServiceError> {
        let signature_type = SignatureType::from_str(&request.signature_type)?;
        let now = self.clock.now_ms();
        let credentials = self
            .applications
            .lookup_credentials(&request.application_key)
            .await?
            .ok_or_else(|| ServiceError::InvalidRequest("unknown application key".into()))?;

        let txn = self.db.begin().await?;
        let activation = storage::find_activation(&txn, &request.activation_id)
            .await?
            .ok_or(ServiceError::ActivationNotFound)?;
        if activation.application_id != credentials.application_id || !credentials.supported {
            return Err(ServiceError::InvalidRequest(
                "application key does not match activation".into(),
            ));
        }
        if activation.activation_status() != ActivationStatus::Active {
            return Err(ServiceError::ActivationIncorrectState);
        }

        let mode = EncryptionMode::from_db(activation.server_private_key_encryption)
            .ok_or_else(|| ServiceError::GenericCryptography("unknown key encryption mode".into()))?;
        let private_bytes = self.codec.decode(
            mode,
            &activation.server_private_key,
            &activation.user_id,
            &activation.activation_id,
        )?;
        let server_private = keys::private_key_from_bytes(&private_bytes)?;
        let (_request_payload, envelope_keys) = ecies::open_request(
            &request.envelope,
            &server_private,
            &credentials.application_secret,
        )?;

        let mut token_id = None;
        for _ in 0..self.settings.crypto.generate_token_id_iterations {
            let candidate = Uuid::new_v4().to_string();
            if storage::find_token(&txn, &candidate).await?.is_none() {
                token_id = Some(candidate);
                break;
            }
        }
        let token_id = token_id.ok_or(ServiceError::UnableToGenerateTokenId)?;

        let mut secret_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut secret_bytes);
        let token_secret = Base64::encode_string(&secret_bytes);

        token::ActiveModel {
            token_id: Set(token_id.clone()),
            token_secret: Set(token_secret.clone()),
            activation_id: Set(request.activation_id.clone()),
            signature_type: Set(signature_type.as_str().to_string()),
            timestamp_created: Set(now),
        }
        .insert(&txn)
        .await?;

        let payload = TokenPayload {
            token_id,
            token_secret,
        };
        let sealed = ecies::seal_with_keys(&envelope_keys, &serde_json::to_vec(&payload)?);
        txn.commit().await?;

        Ok(CreateTokenResponse {
            activation_id: request.activation_id.clone(),
            envelope: sealed,
        })
    }

    /// Validate a token digest. Invalid tokens are a negative result, not a
    /// transport error.
    pub async fn validate_token(
        &self,
        request: &ValidateTokenRequest,
    ) -> Result<ValidateTokenResponse, ServiceError> {
        let now = self.clock.now_ms();

        let Some(token) = storage::find_token(&self.db, &request.token_id).await? else {
            return Ok(invalid_token());
        };
        let Some(activation) = storage::find_activation(&self.db, &token.activation_id).await? else {
            return Ok(invalid_token());
        };
        if activation.activation_status() != ActivationStatus::Active {
            return Ok(invalid_token());
        }
        if (now - request.timestamp).abs() > self.settings.token.timestamp_validity_ms {
            return Ok(invalid_token());
        }

        let secret_bytes = Base64::decode_vec(&token.token_secret)
            .map_err(|_| ServiceError::GenericCryptography("stored token secret is corrupt".into()))?;
        let message = format!("{}&{}", request.nonce, request.timestamp);
        let expected = keys::hmac_sha256(&secret_bytes, message.as_bytes());
        let expected_b64 = Base64::encode_string(&expected);
        let valid: bool = expected_b64
            .as_bytes()
            .ct_eq(request.token_digest.as_bytes())
            .into();
        if !valid {
            return Ok(invalid_token());
        }

        Ok(ValidateTokenResponse {
            token_valid: true,
            activation_id: Some(activation.activation_id),
            user_id: Some(activation.user_id),
            application_id: Some(activation.application_id),
            signature_type: Some(token.signature_type),
        })
    }

    pub async fn remove_token(
        &self,
        token_id: &str,
        activation_id: &str,
    ) -> Result<RemoveTokenResponse, ServiceError> {
        let removed = storage::remove_token(&self.db, token_id, activation_id).await?;
        Ok(RemoveTokenResponse {
            token_id: token_id.to_string(),
            removed,
        })
    }
}
