//! Encrypted 16-byte activation status blob delivered on status queries.
//!
//! The plaintext is a single AES block, so the cipher runs in CBC mode with
//! no padding and an IV derived from the activation counter; there is no
//! room in the wire format for an AEAD tag. Unknown activations get an
//! unkeyed random blob so their absence is indistinguishable.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use super::keys::hmac_sha256;
use crate::errors::ServiceError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const STATUS_BLOB_LEN: usize = 16;

/// Current protocol major version reported in status blobs.
pub const PROTOCOL_VERSION: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusBlob {
    pub status: u8,
    pub current_version: u8,
    pub upgrade_version: u8,
    pub failed_attempts: u8,
    pub max_failed_attempts: u8,
    /// Distance between device and server counters when known, else zero.
    pub counter_distance: u8,
}

/// IV bound to the counter so each chain position decrypts differently.
fn status_iv(transport_key: &[u8; 16], counter: u64) -> [u8; 16] {
    let mut input = [0u8; 25];
    input[..9].copy_from_slice(b"status-iv");
    input[17..].copy_from_slice(&counter.to_be_bytes());
    let digest = hmac_sha256(transport_key, &input);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

pub fn encrypt_status_blob(
    blob: &StatusBlob,
    transport_key: &[u8; 16],
    counter: u64,
) -> [u8; STATUS_BLOB_LEN] {
    let mut plaintext = [0u8; STATUS_BLOB_LEN];
    plaintext[0] = blob.status;
    plaintext[1] = blob.current_version;
    plaintext[2] = blob.upgrade_version;
    plaintext[3] = blob.failed_attempts;
    plaintext[4] = blob.max_failed_attempts;
    plaintext[5] = blob.counter_distance;
    OsRng.fill_bytes(&mut plaintext[6..]);

    let iv = status_iv(transport_key, counter);
    let mut block = plaintext;
    Aes128CbcEnc::new(transport_key.into(), &iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut block, STATUS_BLOB_LEN)
        .expect("single block always fits");
    block
}

pub fn decrypt_status_blob(
    data: &[u8],
    transport_key: &[u8; 16],
    counter: u64,
) -> Result<StatusBlob, ServiceError> {
    if data.len() != STATUS_BLOB_LEN {
        return Err(ServiceError::GenericCryptography(
            "status blob must be exactly 16 bytes".into(),
        ));
    }
    let iv = status_iv(transport_key, counter);
    let mut block = [0u8; STATUS_BLOB_LEN];
    block.copy_from_slice(data);
    Aes128CbcDec::new(transport_key.into(), &iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut block)
        .map_err(|_| ServiceError::GenericCryptography("status blob decryption failed".into()))?;
    Ok(StatusBlob {
        status: block[0],
        current_version: block[1],
        upgrade_version: block[2],
        failed_attempts: block[3],
        max_failed_attempts: block[4],
        counter_distance: block[5],
    })
}

/// Unkeyed random blob for unknown activations and activations without an
/// established device key.
pub fn random_status_blob() -> [u8; STATUS_BLOB_LEN] {
    let mut blob = [0u8; STATUS_BLOB_LEN];
    OsRng.fill_bytes(&mut blob);
    blob
}
