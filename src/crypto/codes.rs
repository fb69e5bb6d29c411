//! Activation and recovery code generation.
//!
//! Codes are 20 symbols from a restricted base-32 alphabet, grouped as
//! `XXXXX-XXXXX-XXXXX-XXXXX`. The first 16 symbols come from the CSPRNG;
//! the final 4 encode a CRC-16/ARC over the ASCII bytes of the first 16 as
//! a 20-bit big-endian value in the same alphabet.

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use super::keys::hmac_sha256;
use base64ct::{Base64, Encoding};

/// Restricted alphabet: no `0/1/I/O` so codes survive human transcription.
pub const CODE_ALPHABET: &[u8; 32] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

const RANDOM_SYMBOLS: usize = 16;
const CHECK_SYMBOLS: usize = 4;

/// Activation IDs are v4 UUIDs; uniqueness is enforced by retry at the
/// service layer.
pub fn generate_activation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh code with a valid checksum.
pub fn generate_code() -> String {
    let mut symbols = [0u8; RANDOM_SYMBOLS];
    let mut random = [0u8; RANDOM_SYMBOLS];
    OsRng.fill_bytes(&mut random);
    for (slot, byte) in symbols.iter_mut().zip(random) {
        *slot = CODE_ALPHABET[(byte & 0x1F) as usize];
    }
    let checksum = crc16_arc(&symbols);
    format_code(&symbols, checksum)
}

/// Validate shape (four dash-separated groups of five alphabet symbols) and
/// checksum of a candidate code.
pub fn validate_code(code: &str) -> bool {
    let groups: Vec<&str> = code.split('-').collect();
    if groups.len() != 4 || groups.iter().any(|g| g.len() != 5) {
        return false;
    }
    let symbols: Vec<u8> = groups.concat().into_bytes();
    if !symbols.iter().all(|s| CODE_ALPHABET.contains(s)) {
        return false;
    }
    let expected = crc16_arc(&symbols[..RANDOM_SYMBOLS]) as u32;
    let mut actual: u32 = 0;
    for symbol in &symbols[RANDOM_SYMBOLS..] {
        let index = CODE_ALPHABET
            .iter()
            .position(|a| a == symbol)
            .expect("symbol already validated") as u32;
        actual = (actual << 5) | index;
    }
    actual == expected
}

fn format_code(symbols: &[u8; RANDOM_SYMBOLS], checksum: u16) -> String {
    let mut all = Vec::with_capacity(RANDOM_SYMBOLS + CHECK_SYMBOLS);
    all.extend_from_slice(symbols);
    // 16-bit checksum as a 20-bit big-endian value, 5 bits per symbol.
    let value = checksum as u32;
    for shift in [15u32, 10, 5, 0] {
        all.push(CODE_ALPHABET[((value >> shift) & 0x1F) as usize]);
    }
    all.chunks(5)
        .map(|chunk| std::str::from_utf8(chunk).expect("alphabet is ASCII"))
        .collect::<Vec<_>>()
        .join("-")
}

/// CRC-16/ARC (reflected, polynomial 0xA001, init 0).
fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// A recovery PUK: 10 decimal digits from the CSPRNG.
pub fn generate_puk() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let value = u64::from_be_bytes(bytes) % 10_000_000_000;
    format!("{:010}", value)
}

/// Hash a PUK for storage: HMAC under a key derived from the recovery code
/// itself, so verification needs the caller-supplied code and nothing else.
pub fn hash_puk(recovery_code: &str, puk: &str) -> String {
    let key = hmac_sha256(recovery_code.as_bytes(), b"recovery-puk");
    let digest = hmac_sha256(&key, puk.as_bytes());
    Base64::encode_string(&digest)
}
