//! Vault unlock: a signed request that releases the device-side vault
//! encryption key, wrapped under the transport key so only the requesting
//! device can unwrap it.

use std::sync::Arc;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};

use crate::crypto::keys;
use crate::errors::ServiceError;
use crate::key_at_rest::{EncryptionMode, KeyAtRestCodec};
use crate::signatures::{SignatureService, VerifySignatureRequest};
use crate::storage;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

#[derive(Clone)]
pub struct VaultService {
    db: DatabaseConnection,
    codec: Arc<KeyAtRestCodec>,
    signatures: SignatureService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnlockRequest {
    pub activation_id: String,
    pub application_key: String,
    /// Canonicalized signed payload of the unlock request.
    pub data: String,
    pub signature: String,
    pub signature_type: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnlockResponse {
    pub activation_id: String,
    pub signature_valid: bool,
    /// Base64 IV||ciphertext of the vault key under the transport key;
    /// absent when the signature did not verify.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_vault_encryption_key: Option<String>,
}

impl VaultService {
    pub fn new(
        db: DatabaseConnection,
        codec: Arc<KeyAtRestCodec>,
        signatures: SignatureService,
    ) -> Self {
        Self {
            db,
            codec,
            signatures,
        }
    }

    /// Verify the unlock signature, then wrap the vault key for transport.
    /// The signature verification carries its usual side effects (counter
    /// advance, failed-attempt accounting, auto-block).
    pub async fn unlock(&self, request: &VaultUnlockRequest) -> Result<VaultUnlockResponse, ServiceError> {
        let verification = self
            .signatures
            .verify(&VerifySignatureRequest {
                activation_id: request.activation_id.clone(),
                data: request.data.clone(),
                signature: request.signature.clone(),
                signature_type: request.signature_type.clone(),
                application_key: request.application_key.clone(),
            })
            .await?;
        if !verification.signature_valid {
            return Ok(VaultUnlockResponse {
                activation_id: request.activation_id.clone(),
                signature_valid: false,
                encrypted_vault_encryption_key: None,
            });
        }

        let activation = storage::find_activation(&self.db, &request.activation_id)
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
        let device_public_b64 = activation
            .device_public_key
            .as_deref()
            .ok_or_else(|| ServiceError::GenericCryptography("activation has no device key".into()))?;
        let device_public = keys::public_key_from_base64(device_public_b64)?;

        let master_secret = keys::shared_master_secret(&server_private, &device_public);
        let vault_key = keys::derive_key(&master_secret, keys::KDF_VAULT);
        let transport_key = keys::derive_key(&master_secret, keys::KDF_TRANSPORT);

        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = Aes128CbcEnc::new(&transport_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&vault_key);
        let mut combined = Vec::with_capacity(16 + ciphertext.len());
        combined.extend_from_slice(&iv);
        combined.extend_from_slice(&ciphertext);

        Ok(VaultUnlockResponse {
            activation_id: request.activation_id.clone(),
            signature_valid: true,
            encrypted_vault_encryption_key: Some(Base64::encode_string(&combined)),
        })
    }
}
