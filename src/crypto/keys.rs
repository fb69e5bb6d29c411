//! EC P-256 key material: generation, serialization, ECDH agreement and the
//! domain-separated key derivation tree hanging off the master secret.
//!
//! Public keys travel as uncompressed SEC1 point bytes, private keys as raw
//! 32-byte scalars, both base64-encoded at rest.

use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use p256::ecdh;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// KDF labels for the per-purpose keys derived from the ECDH master secret.
pub const KDF_TRANSPORT: &str = "transport";
pub const KDF_SIGNATURE_POSSESSION: &str = "signature-possession";
pub const KDF_SIGNATURE_KNOWLEDGE: &str = "signature-knowledge";
pub const KDF_SIGNATURE_BIOMETRY: &str = "signature-biometry";
pub const KDF_TOKEN: &str = "token";
pub const KDF_VAULT: &str = "vault";

pub struct ServerKeyPair {
    pub private: SecretKey,
    pub public: PublicKey,
}

/// Generate a fresh P-256 key pair from the OS CSPRNG.
pub fn generate_key_pair() -> ServerKeyPair {
    let private = SecretKey::random(&mut OsRng);
    let public = private.public_key();
    ServerKeyPair { private, public }
}

pub fn public_key_to_bytes(key: &PublicKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

pub fn public_key_to_base64(key: &PublicKey) -> String {
    Base64::encode_string(&public_key_to_bytes(key))
}

pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, ServiceError> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| ServiceError::InvalidKeyFormat("not a valid P-256 point".into()))
}

pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey, ServiceError> {
    let bytes = Base64::decode_vec(encoded)
        .map_err(|_| ServiceError::InvalidKeyFormat("invalid base64 public key".into()))?;
    public_key_from_bytes(&bytes)
}

pub fn private_key_to_base64(key: &SecretKey) -> String {
    Base64::encode_string(key.to_bytes().as_slice())
}

pub fn private_key_from_bytes(bytes: &[u8]) -> Result<SecretKey, ServiceError> {
    SecretKey::from_slice(bytes)
        .map_err(|_| ServiceError::InvalidKeyFormat("not a valid P-256 scalar".into()))
}

pub fn private_key_from_base64(encoded: &str) -> Result<SecretKey, ServiceError> {
    let bytes = Base64::decode_vec(encoded)
        .map_err(|_| ServiceError::InvalidKeyFormat("invalid base64 private key".into()))?;
    private_key_from_bytes(&bytes)
}

/// ECDH master secret: the X coordinate of the shared point, 32 bytes.
pub fn shared_master_secret(server_private: &SecretKey, device_public: &PublicKey) -> [u8; 32] {
    let shared = ecdh::diffie_hellman(server_private.to_nonzero_scalar(), device_public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    out
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Derive a 16-byte AES key from a 32-byte master secret under a label.
pub fn derive_key(master: &[u8; 32], label: &str) -> [u8; 16] {
    let digest = hmac_sha256(master, label.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// ECDSA (SHA-256, DER) signature over an activation code, issued under the
/// application's current master private key.
pub fn sign_activation_code(code: &str, master_private: &SecretKey) -> Vec<u8> {
    let signing_key = SigningKey::from(master_private);
    let signature: Signature = signing_key.sign(code.as_bytes());
    signature.to_der().as_bytes().to_vec()
}

pub fn verify_activation_signature(
    code: &str,
    signature_der: &[u8],
    master_public: &PublicKey,
) -> bool {
    let verifying_key = VerifyingKey::from(master_public);
    match Signature::from_der(signature_der) {
        Ok(signature) => verifying_key.verify(code.as_bytes(), &signature).is_ok(),
        Err(_) => false,
    }
}

/// ECDSA (SHA-256, DER) over arbitrary payload bytes, used by offline
/// signature payloads.
pub fn sign_data(data: &[u8], private: &SecretKey) -> Vec<u8> {
    let signing_key = SigningKey::from(private);
    let signature: Signature = signing_key.sign(data);
    signature.to_der().as_bytes().to_vec()
}

pub fn verify_data(data: &[u8], signature_der: &[u8], public: &PublicKey) -> bool {
    let verifying_key = VerifyingKey::from(public);
    match Signature::from_der(signature_der) {
        Ok(signature) => verifying_key.verify(data, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Device public key fingerprint: the SHA-256 of
/// `device_pub_x || activation_id || server_pub_x` reduced modulo 1e8,
/// rendered as 8 zero-padded decimal digits.
pub fn device_fingerprint(
    device_public: &PublicKey,
    activation_id: &str,
    server_public: &PublicKey,
) -> String {
    let device_point = device_public.to_encoded_point(false);
    let server_point = server_public.to_encoded_point(false);
    let mut hasher = Sha256::new();
    hasher.update(device_point.x().expect("uncompressed point has X"));
    hasher.update(activation_id.as_bytes());
    hasher.update(server_point.x().expect("uncompressed point has X"));
    let digest = hasher.finalize();

    // Big-endian residue of the full digest modulo 1e8, byte-wise Horner.
    let mut acc: u64 = 0;
    for byte in digest {
        acc = (acc * 256 + byte as u64) % 100_000_000;
    }
    format!("{:08}", acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pair_round_trips_through_base64() {
        let pair = generate_key_pair();
        let public = public_key_from_base64(&public_key_to_base64(&pair.public)).unwrap();
        let private = private_key_from_base64(&private_key_to_base64(&pair.private)).unwrap();
        assert_eq!(public, pair.public);
        assert_eq!(private.to_bytes(), pair.private.to_bytes());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let server = generate_key_pair();
        let device = generate_key_pair();
        let a = shared_master_secret(&server.private, &device.public);
        let b = shared_master_secret(&device.private, &server.public);
        assert_eq!(a, b);
    }

    #[test]
    fn derived_keys_are_domain_separated() {
        let server = generate_key_pair();
        let device = generate_key_pair();
        let master = shared_master_secret(&server.private, &device.public);
        let transport = derive_key(&master, KDF_TRANSPORT);
        let possession = derive_key(&master, KDF_SIGNATURE_POSSESSION);
        let vault = derive_key(&master, KDF_VAULT);
        assert_ne!(transport, possession);
        assert_ne!(transport, vault);
        assert_ne!(possession, vault);
    }

    #[test]
    fn activation_signature_verifies_and_rejects_tamper() {
        let master = generate_key_pair();
        let signature = sign_activation_code("AAAAA-BBBBB-CCCCC-DDDDD", &master.private);
        assert!(verify_activation_signature(
            "AAAAA-BBBBB-CCCCC-DDDDD",
            &signature,
            &master.public
        ));
        assert!(!verify_activation_signature(
            "AAAAA-BBBBB-CCCCC-EEEEE",
            &signature,
            &master.public
        ));
    }

    #[test]
    fn fingerprint_is_eight_decimal_digits() {
        let server = generate_key_pair();
        let device = generate_key_pair();
        let fp = device_fingerprint(&device.public, "8a02b153-1ab7-4f9b-a10d-5e41f1e25d20", &server.public);
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn rejects_garbage_public_key() {
        assert!(public_key_from_bytes(&[0x04; 65]).is_err());
        assert!(public_key_from_base64("not-base64!").is_err());
    }
}
