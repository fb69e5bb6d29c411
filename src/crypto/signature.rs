//! Counter-bound request signature computation.
//!
//! A signature is one 8-decimal-digit component per factor, joined with
//! dashes. Factor keys derive from the ECDH master secret and aggregate
//! cumulatively by XOR in deterministic order, so a two-factor signature
//! commits to both keys in its second component.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::keys::{
    derive_key, KDF_SIGNATURE_BIOMETRY, KDF_SIGNATURE_KNOWLEDGE, KDF_SIGNATURE_POSSESSION,
};
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Application secret constant used for offline (QR-code) signatures, which
/// are computed without a connected application context.
pub const OFFLINE_APPLICATION_SECRET: &str = "offline";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Factor {
    Possession,
    Knowledge,
    Biometry,
}

impl Factor {
    fn kdf_label(self) -> &'static str {
        match self {
            Factor::Possession => KDF_SIGNATURE_POSSESSION,
            Factor::Knowledge => KDF_SIGNATURE_KNOWLEDGE,
            Factor::Biometry => KDF_SIGNATURE_BIOMETRY,
        }
    }
}

/// Requested combination of authentication factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureType {
    Possession,
    Knowledge,
    Biometry,
    PossessionKnowledge,
    PossessionBiometry,
    PossessionKnowledgeBiometry,
}

impl SignatureType {
    pub fn from_str(value: &str) -> Result<Self, ServiceError> {
        match value.to_ascii_uppercase().as_str() {
            "POSSESSION" => Ok(SignatureType::Possession),
            "KNOWLEDGE" => Ok(SignatureType::Knowledge),
            "BIOMETRY" => Ok(SignatureType::Biometry),
            "POSSESSION_KNOWLEDGE" => Ok(SignatureType::PossessionKnowledge),
            "POSSESSION_BIOMETRY" => Ok(SignatureType::PossessionBiometry),
            "POSSESSION_KNOWLEDGE_BIOMETRY" => Ok(SignatureType::PossessionKnowledgeBiometry),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown signature type: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignatureType::Possession => "POSSESSION",
            SignatureType::Knowledge => "KNOWLEDGE",
            SignatureType::Biometry => "BIOMETRY",
            SignatureType::PossessionKnowledge => "POSSESSION_KNOWLEDGE",
            SignatureType::PossessionBiometry => "POSSESSION_BIOMETRY",
            SignatureType::PossessionKnowledgeBiometry => "POSSESSION_KNOWLEDGE_BIOMETRY",
        }
    }

    /// Factors in deterministic aggregation order.
    pub fn factors(self) -> &'static [Factor] {
        match self {
            SignatureType::Possession => &[Factor::Possession],
            SignatureType::Knowledge => &[Factor::Knowledge],
            SignatureType::Biometry => &[Factor::Biometry],
            SignatureType::PossessionKnowledge => &[Factor::Possession, Factor::Knowledge],
            SignatureType::PossessionBiometry => &[Factor::Possession, Factor::Biometry],
            SignatureType::PossessionKnowledgeBiometry => {
                &[Factor::Possession, Factor::Knowledge, Factor::Biometry]
            }
        }
    }
}

/// Derive the per-factor signature keys for a given type.
pub fn derive_factor_keys(master_secret: &[u8; 32], signature_type: SignatureType) -> Vec<[u8; 16]> {
    signature_type
        .factors()
        .iter()
        .map(|factor| derive_key(master_secret, factor.kdf_label()))
        .collect()
}

/// Counter encoded as a 16-byte big-endian block, the HMAC chain position.
fn counter_bytes(counter: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[8..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Compute the signature for the given factor keys at a counter position.
pub fn compute_signature(
    factor_keys: &[[u8; 16]],
    counter: u64,
    data: &[u8],
    application_secret: &str,
) -> String {
    let ctr = counter_bytes(counter);
    let mut aggregated = [0u8; 16];
    let mut components = Vec::with_capacity(factor_keys.len());
    for key in factor_keys {
        for (slot, byte) in aggregated.iter_mut().zip(key) {
            *slot ^= *byte;
        }
        // Bind the aggregated key to the counter, then authenticate the data
        // together with the application secret.
        let mut counter_mac =
            HmacSha256::new_from_slice(&aggregated).expect("HMAC accepts any key length");
        counter_mac.update(&ctr);
        let counter_key = counter_mac.finalize().into_bytes();

        let mut data_mac =
            HmacSha256::new_from_slice(&counter_key).expect("HMAC accepts any key length");
        data_mac.update(data);
        data_mac.update(application_secret.as_bytes());
        let digest = data_mac.finalize().into_bytes();

        let tail = u32::from_be_bytes([digest[28], digest[29], digest[30], digest[31]]);
        components.push(format!("{:08}", (tail & 0x7FFF_FFFF) % 100_000_000));
    }
    components.join("-")
}

/// Constant-time signature comparison; length mismatch is an immediate
/// rejection since component counts are public.
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{generate_key_pair, shared_master_secret};

    fn master_secret() -> [u8; 32] {
        let server = generate_key_pair();
        let device = generate_key_pair();
        shared_master_secret(&server.private, &device.public)
    }

    #[test]
    fn signature_shape_matches_factor_count() {
        let master = master_secret();
        for (st, dashes) in [
            (SignatureType::Possession, 0),
            (SignatureType::PossessionKnowledge, 1),
            (SignatureType::PossessionKnowledgeBiometry, 2),
        ] {
            let keys = derive_factor_keys(&master, st);
            let sig = compute_signature(&keys, 0, b"data", "secret");
            assert_eq!(sig.matches('-').count(), dashes);
            assert_eq!(sig.len(), 8 * (dashes + 1) + dashes);
            assert!(sig.chars().all(|c| c.is_ascii_digit() || c == '-'));
        }
    }

    #[test]
    fn signature_changes_with_counter_data_and_secret() {
        let master = master_secret();
        let keys = derive_factor_keys(&master, SignatureType::Possession);
        let base = compute_signature(&keys, 5, b"data", "secret");
        assert_ne!(base, compute_signature(&keys, 6, b"data", "secret"));
        assert_ne!(base, compute_signature(&keys, 5, b"tampered", "secret"));
        assert_ne!(base, compute_signature(&keys, 5, b"data", "other"));
        assert_eq!(base, compute_signature(&keys, 5, b"data", "secret"));
    }

    #[test]
    fn multi_factor_signature_commits_to_all_keys() {
        let master = master_secret();
        let both = derive_factor_keys(&master, SignatureType::PossessionKnowledge);
        let possession_only = derive_factor_keys(&master, SignatureType::Possession);
        let two = compute_signature(&both, 0, b"data", "secret");
        let one = compute_signature(&possession_only, 0, b"data", "secret");
        // First component matches (same first factor), second differs.
        assert_eq!(&two[..8], &one[..8]);
        assert_eq!(two.len(), 17);
    }

    #[test]
    fn comparison_accepts_equal_and_rejects_unequal() {
        assert!(signatures_match("12345678", "12345678"));
        assert!(!signatures_match("12345678", "12345679"));
        assert!(!signatures_match("12345678", "12345678-00000000"));
    }

    #[test]
    fn signature_type_parsing_round_trips() {
        for st in [
            SignatureType::Possession,
            SignatureType::Knowledge,
            SignatureType::Biometry,
            SignatureType::PossessionKnowledge,
            SignatureType::PossessionBiometry,
            SignatureType::PossessionKnowledgeBiometry,
        ] {
            assert_eq!(SignatureType::from_str(st.as_str()).unwrap(), st);
        }
        assert!(SignatureType::from_str("POSSESSION_VOICE").is_err());
    }
}
