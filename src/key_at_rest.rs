//! At-rest codec for server private keys.
//!
//! Two per-row modes: `NO_ENCRYPTION` stores the plaintext base64 scalar;
//! `AES_HMAC` encrypts it with AES-128-CBC under a row secret derived as
//! `HMAC-SHA256(master_db_key, user_id || activation_id)[..16]`, with a
//! fresh random IV prepended to the ciphertext. The decoder honors the mode
//! recorded on each row regardless of the current configuration, so turning
//! encryption on is additive.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::keys::hmac_sha256;
use crate::errors::ServiceError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    NoEncryption,
    AesHmac,
}

impl EncryptionMode {
    pub fn to_db(self) -> i64 {
        match self {
            EncryptionMode::NoEncryption => 0,
            EncryptionMode::AesHmac => 1,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(EncryptionMode::NoEncryption),
            1 => Some(EncryptionMode::AesHmac),
            _ => None,
        }
    }
}

/// Codec holding the optional master database encryption key.
#[derive(Clone)]
pub struct KeyAtRestCodec {
    master_key: Option<Vec<u8>>,
}

impl KeyAtRestCodec {
    /// Build the codec from the configured base64 master key; an empty
    /// string yields the identity codec.
    pub fn from_master_key(master_db_key: &str) -> Result<Self, ServiceError> {
        if master_db_key.is_empty() {
            return Ok(Self { master_key: None });
        }
        let key = Base64::decode_vec(master_db_key).map_err(|_| {
            ServiceError::InvalidKeyFormat("master DB encryption key is not valid base64".into())
        })?;
        if key.len() < 16 {
            return Err(ServiceError::InvalidKeyFormat(
                "master DB encryption key must be at least 16 bytes".into(),
            ));
        }
        Ok(Self { master_key: Some(key) })
    }

    pub fn encryption_enabled(&self) -> bool {
        self.master_key.is_some()
    }

    fn row_secret(&self, master: &[u8], user_id: &str, activation_id: &str) -> [u8; 16] {
        let mut input = Vec::with_capacity(user_id.len() + activation_id.len());
        input.extend_from_slice(user_id.as_bytes());
        input.extend_from_slice(activation_id.as_bytes());
        let digest = hmac_sha256(master, &input);
        let mut secret = [0u8; 16];
        secret.copy_from_slice(&digest[..16]);
        secret
    }

    /// Encode a private key for storage, returning the mode tag and the
    /// column value.
    pub fn encode(
        &self,
        private_key: &[u8],
        user_id: &str,
        activation_id: &str,
    ) -> (EncryptionMode, String) {
        match &self.master_key {
            None => (EncryptionMode::NoEncryption, Base64::encode_string(private_key)),
            Some(master) => {
                let secret = self.row_secret(master, user_id, activation_id);
                let mut iv = [0u8; 16];
                OsRng.fill_bytes(&mut iv);
                let ciphertext = Aes128CbcEnc::new(&secret.into(), &iv.into())
                    .encrypt_padded_vec_mut::<Pkcs7>(private_key);
                let mut combined = Vec::with_capacity(16 + ciphertext.len());
                combined.extend_from_slice(&iv);
                combined.extend_from_slice(&ciphertext);
                (EncryptionMode::AesHmac, Base64::encode_string(&combined))
            }
        }
    }

    /// Decode a stored private key according to its recorded mode.
    pub fn decode(
        &self,
        mode: EncryptionMode,
        value: &str,
        user_id: &str,
        activation_id: &str,
    ) -> Result<Vec<u8>, ServiceError> {
        match mode {
            EncryptionMode::NoEncryption => Base64::decode_vec(value)
                .map_err(|_| ServiceError::InvalidKeyFormat("invalid base64 private key".into())),
            EncryptionMode::AesHmac => {
                let master = self.master_key.as_deref().ok_or_else(|| {
                    ServiceError::GenericCryptography(
                        "row is encrypted but no master DB encryption key is configured".into(),
                    )
                })?;
                let combined = Base64::decode_vec(value).map_err(|_| {
                    ServiceError::InvalidKeyFormat("invalid base64 encrypted private key".into())
                })?;
                if combined.len() < 32 {
                    return Err(ServiceError::GenericCryptography(
                        "encrypted private key is truncated".into(),
                    ));
                }
                let secret = self.row_secret(master, user_id, activation_id);
                let (iv, ciphertext) = combined.split_at(16);
                let mut iv_block = [0u8; 16];
                iv_block.copy_from_slice(iv);
                Aes128CbcDec::new(&secret.into(), &iv_block.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| {
                        ServiceError::GenericCryptography("private key decryption failed".into())
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_KEY_B64: &str = "q80/Nzb8DB5xdhDMC4LhRQ=="; // 16 bytes

    fn encrypting_codec() -> KeyAtRestCodec {
        KeyAtRestCodec::from_master_key(MASTER_KEY_B64).unwrap()
    }

    #[test]
    fn identity_codec_round_trips_plaintext() {
        let codec = KeyAtRestCodec::from_master_key("").unwrap();
        assert!(!codec.encryption_enabled());
        let (mode, value) = codec.encode(b"private-key-bytes", "alice", "activation-1");
        assert_eq!(mode, EncryptionMode::NoEncryption);
        let decoded = codec.decode(mode, &value, "alice", "activation-1").unwrap();
        assert_eq!(decoded, b"private-key-bytes");
    }

    #[test]
    fn aes_hmac_round_trips() {
        let codec = encrypting_codec();
        let (mode, value) = codec.encode(b"private-key-bytes", "alice", "activation-1");
        assert_eq!(mode, EncryptionMode::AesHmac);
        let decoded = codec.decode(mode, &value, "alice", "activation-1").unwrap();
        assert_eq!(decoded, b"private-key-bytes");
    }

    #[test]
    fn wrong_master_key_fails_or_garbles() {
        let codec = encrypting_codec();
        let (mode, value) = codec.encode(b"private-key-bytes", "alice", "activation-1");
        let wrong = KeyAtRestCodec::from_master_key("AAAAAAAAAAAAAAAAAAAAAA==").unwrap();
        match wrong.decode(mode, &value, "alice", "activation-1") {
            Err(_) => {}
            Ok(decoded) => assert_ne!(decoded, b"private-key-bytes"),
        }
    }

    #[test]
    fn row_secret_binds_user_and_activation() {
        let codec = encrypting_codec();
        let (mode, value) = codec.encode(b"private-key-bytes", "alice", "activation-1");
        match codec.decode(mode, &value, "bob", "activation-1") {
            Err(_) => {}
            Ok(decoded) => assert_ne!(decoded, b"private-key-bytes"),
        }
        match codec.decode(mode, &value, "alice", "activation-2") {
            Err(_) => {}
            Ok(decoded) => assert_ne!(decoded, b"private-key-bytes"),
        }
    }

    #[test]
    fn decoder_accepts_plaintext_rows_when_encryption_is_on() {
        let plain = KeyAtRestCodec::from_master_key("").unwrap();
        let (mode, value) = plain.encode(b"legacy-key", "alice", "activation-1");
        let encrypting = encrypting_codec();
        let decoded = encrypting.decode(mode, &value, "alice", "activation-1").unwrap();
        assert_eq!(decoded, b"legacy-key");
    }

    #[test]
    fn encrypted_row_without_key_is_an_error() {
        let codec = encrypting_codec();
        let (mode, value) = codec.encode(b"private-key-bytes", "alice", "activation-1");
        let identity = KeyAtRestCodec::from_master_key("").unwrap();
        assert!(identity.decode(mode, &value, "alice", "activation-1").is_err());
    }

    #[test]
    fn rejects_invalid_master_key_configuration() {
        assert!(KeyAtRestCodec::from_master_key("!!!not-base64!!!").is_err());
        assert!(KeyAtRestCodec::from_master_key("c2hvcnQ=").is_err()); // "short"
    }
}
