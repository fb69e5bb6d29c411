//! ECIES envelope protecting activation and token payloads in transit.
//!
//! The client generates an ephemeral P-256 pair, agrees on a shared secret
//! with the server's published key, and derives an encryption key and a MAC
//! key bound to the application secret. Payloads travel as AES-128-CBC
//! (PKCS7) ciphertext with an HMAC-SHA256 tag over the ciphertext; the
//! 16-byte nonce doubles as the CBC IV. Server responses reuse the derived
//! keys with a fresh nonce and carry no ephemeral key.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64ct::{Base64, Encoding};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::keys::{hmac_sha256, public_key_from_base64, public_key_to_base64, shared_master_secret};
use crate::errors::ServiceError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Wire form of an ECIES-protected payload. All fields are base64.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Present on requests; responses reuse the request's key agreement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<String>,
    pub encrypted_data: String,
    pub mac: String,
    pub nonce: String,
}

/// Keys derived from one ECDH agreement, kept to seal the response.
pub struct EnvelopeKeys {
    enc: [u8; 16],
    mac: [u8; 32],
}

/// Derive envelope keys from the ECDH shared secret and application secret.
pub fn derive_envelope_keys(shared: &[u8; 32], application_secret: &str) -> EnvelopeKeys {
    let mut enc_input = Vec::with_capacity(9 + application_secret.len());
    enc_input.extend_from_slice(b"ecies-enc");
    enc_input.extend_from_slice(application_secret.as_bytes());
    let mut mac_input = Vec::with_capacity(9 + application_secret.len());
    mac_input.extend_from_slice(b"ecies-mac");
    mac_input.extend_from_slice(application_secret.as_bytes());

    let enc_digest = hmac_sha256(shared, &enc_input);
    let mut enc = [0u8; 16];
    enc.copy_from_slice(&enc_digest[..16]);
    EnvelopeKeys {
        enc,
        mac: hmac_sha256(shared, &mac_input),
    }
}

/// Client-side sealing of a request envelope. Returns the derived keys so
/// the caller can open the sealed response.
pub fn seal_request(
    server_public: &PublicKey,
    application_secret: &str,
    plaintext: &[u8],
) -> (Envelope, EnvelopeKeys) {
    let ephemeral = SecretKey::random(&mut OsRng);
    let ephemeral_public = ephemeral.public_key();
    let shared = shared_master_secret(&ephemeral, server_public);
    let keys = derive_envelope_keys(&shared, application_secret);
    let mut envelope = seal_with_keys(&keys, plaintext);
    envelope.ephemeral_public_key = Some(public_key_to_base64(&ephemeral_public));
    (envelope, keys)
}

/// Open a request envelope with the server private key, returning the
/// plaintext and the derived keys for sealing the response.
pub fn open_request(
    envelope: &Envelope,
    server_private: &SecretKey,
    application_secret: &str,
) -> Result<(Vec<u8>, EnvelopeKeys), ServiceError> {
    let ephemeral = envelope
        .ephemeral_public_key
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidRequest("missing ephemeral public key".into()))?;
    let ephemeral_public = public_key_from_base64(ephemeral)?;
    let shared = shared_master_secret(server_private, &ephemeral_public);
    let keys = derive_envelope_keys(&shared, application_secret);
    let plaintext = open_with_keys(&keys, envelope)?;
    Ok((plaintext, keys))
}

/// Seal a payload under already-derived keys (server responses).
pub fn seal_with_keys(keys: &EnvelopeKeys, plaintext: &[u8]) -> Envelope {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = Aes128CbcEnc::new(&keys.enc.into(), &nonce.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mac = hmac_sha256(&keys.mac, &ciphertext);
    Envelope {
        ephemeral_public_key: None,
        encrypted_data: Base64::encode_string(&ciphertext),
        mac: Base64::encode_string(&mac),
        nonce: Base64::encode_string(&nonce),
    }
}

/// Open a payload under already-derived keys (client side of responses).
pub fn open_with_keys(keys: &EnvelopeKeys, envelope: &Envelope) -> Result<Vec<u8>, ServiceError> {
    let ciphertext = Base64::decode_vec(&envelope.encrypted_data)
        .map_err(|_| ServiceError::InvalidRequest("invalid base64 encrypted data".into()))?;
    let mac = Base64::decode_vec(&envelope.mac)
        .map_err(|_| ServiceError::InvalidRequest("invalid base64 mac".into()))?;
    let nonce = Base64::decode_vec(&envelope.nonce)
        .map_err(|_| ServiceError::InvalidRequest("invalid base64 nonce".into()))?;
    if nonce.len() != 16 {
        return Err(ServiceError::InvalidRequest("nonce must be 16 bytes".into()));
    }

    let expected_mac = hmac_sha256(&keys.mac, &ciphertext);
    if !bool::from(expected_mac.ct_eq(mac.as_slice())) {
        return Err(ServiceError::GenericCryptography("envelope MAC mismatch".into()));
    }

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&nonce);
    Aes128CbcDec::new(&keys.enc.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| ServiceError::GenericCryptography("envelope decryption failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_key_pair;

    #[test]
    fn request_round_trip() {
        let server = generate_key_pair();
        let (envelope, _) = seal_request(&server.public, "app-secret", b"device public key bytes");
        let (plaintext, _keys) = open_request(&envelope, &server.private, "app-secret").unwrap();
        assert_eq!(plaintext, b"device public key bytes");
    }

    #[test]
    fn response_round_trip_reuses_keys() {
        let server = generate_key_pair();
        let (envelope, client_keys) = seal_request(&server.public, "app-secret", b"request");
        let (_plaintext, server_keys) = open_request(&envelope, &server.private, "app-secret").unwrap();
        let response = seal_with_keys(&server_keys, b"response payload");
        assert!(response.ephemeral_public_key.is_none());
        let opened = open_with_keys(&client_keys, &response).unwrap();
        assert_eq!(opened, b"response payload");
    }

    #[test]
    fn wrong_application_secret_fails_mac() {
        let server = generate_key_pair();
        let (envelope, _) = seal_request(&server.public, "app-secret", b"request");
        let result = open_request(&envelope, &server.private, "other-secret");
        assert!(result.is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let server = generate_key_pair();
        let (mut envelope, _) = seal_request(&server.public, "app-secret", b"request");
        let mut raw = Base64::decode_vec(&envelope.encrypted_data).unwrap();
        raw[0] ^= 0x01;
        envelope.encrypted_data = Base64::encode_string(&raw);
        assert!(open_request(&envelope, &server.private, "app-secret").is_err());
    }

    #[test]
    fn missing_ephemeral_key_is_rejected() {
        let server = generate_key_pair();
        let (mut envelope, _) = seal_request(&server.public, "app-secret", b"request");
        envelope.ephemeral_public_key = None;
        assert!(open_request(&envelope, &server.private, "app-secret").is_err());
    }
}
