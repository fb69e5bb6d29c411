// Integration tests for token issuance/validation and vault unlock.

mod helpers;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64ct::{Base64, Encoding};
use helpers::{activate_device, build_services, seed_application, ActivatedDevice, TestDb,
    TestServices};
use keystone::clock::Clock;
use keystone::crypto::signature::SignatureType;
use keystone::crypto::{ecies, keys};
use keystone::errors::ServiceError;
use keystone::tokens::{CreateTokenRequest, TokenPayload, ValidateTokenRequest};
use keystone::vault::VaultUnlockRequest;
use keystone::storage;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Client side of token issuance: seal an empty request to the activation's
/// server public key and open the sealed token payload.
async fn issue_token(
    services: &TestServices,
    device: &ActivatedDevice,
    application_key: &str,
    application_secret: &str,
) -> TokenPayload {
    let server_public = keys::public_key_from_base64(&device.payload.server_public_key).unwrap();
    let (envelope, client_keys) = ecies::seal_request(&server_public, application_secret, b"{}");
    let response = services
        .tokens
        .create_token(&CreateTokenRequest {
            activation_id: device.activation_id.clone(),
            application_key: application_key.to_string(),
            signature_type: "POSSESSION".to_string(),
            envelope,
        })
        .await
        .expect("Failed to create token");
    let payload_bytes =
        ecies::open_with_keys(&client_keys, &response.envelope).expect("Failed to open token payload");
    serde_json::from_slice(&payload_bytes).expect("Invalid token payload")
}

fn token_digest(token_secret: &str, nonce: &str, timestamp: i64) -> String {
    let secret = Base64::decode_vec(token_secret).unwrap();
    let message = format!("{nonce}&{timestamp}");
    Base64::encode_string(&keys::hmac_sha256(&secret, message.as_bytes()))
}

#[tokio::test]
async fn token_create_and_validate() {
    let test_db = TestDb::new().await;
    let clock = Clock::fixed(1_700_000_000_000);
    let services = build_services(test_db.connection(), clock.clone());
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let token = issue_token(&services, &device, &app.application_key, &app.application_secret).await;
    assert!(!token.token_id.is_empty());

    let timestamp = clock.now_ms();
    let response = services
        .tokens
        .validate_token(&ValidateTokenRequest {
            token_id: token.token_id.clone(),
            token_digest: token_digest(&token.token_secret, "nonce-1", timestamp),
            nonce: "nonce-1".to_string(),
            timestamp,
        })
        .await
        .unwrap();
    assert!(response.token_valid);
    assert_eq!(response.activation_id.as_deref(), Some(device.activation_id.as_str()));
    assert_eq!(response.user_id.as_deref(), Some("alice"));
    assert_eq!(response.application_id, Some(app.application_id));
    assert_eq!(response.signature_type.as_deref(), Some("POSSESSION"));
}

#[tokio::test]
async fn stale_token_timestamp_is_rejected() {
    let test_db = TestDb::new().await;
    let clock = Clock::fixed(1_700_000_000_000);
    let services = build_services(test_db.connection(), clock.clone());
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;
    let token = issue_token(&services, &device, &app.application_key, &app.application_secret).await;

    // Timestamp older than the freshness window (2 hours by default).
    let stale = clock.now_ms() - 7_200_001;
    let response = services
        .tokens
        .validate_token(&ValidateTokenRequest {
            token_id: token.token_id.clone(),
            token_digest: token_digest(&token.token_secret, "nonce-1", stale),
            nonce: "nonce-1".to_string(),
            timestamp: stale,
        })
        .await
        .unwrap();
    assert!(!response.token_valid);
}

#[tokio::test]
async fn wrong_token_digest_is_rejected() {
    let test_db = TestDb::new().await;
    let clock = Clock::fixed(1_700_000_000_000);
    let services = build_services(test_db.connection(), clock.clone());
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;
    let token = issue_token(&services, &device, &app.application_key, &app.application_secret).await;

    let timestamp = clock.now_ms();
    // Digest computed over a different nonce than the one presented.
    let response = services
        .tokens
        .validate_token(&ValidateTokenRequest {
            token_id: token.token_id.clone(),
            token_digest: token_digest(&token.token_secret, "nonce-2", timestamp),
            nonce: "nonce-1".to_string(),
            timestamp,
        })
        .await
        .unwrap();
    assert!(!response.token_valid);

    // Unknown token IDs are a negative result, not an error.
    let response = services
        .tokens
        .validate_token(&ValidateTokenRequest {
            token_id: "00000000-0000-0000-0000-000000000000".to_string(),
            token_digest: token_digest(&token.token_secret, "nonce-1", timestamp),
            nonce: "nonce-1".to_string(),
            timestamp,
        })
        .await
        .unwrap();
    assert!(!response.token_valid);
}

#[tokio::test]
async fn token_requires_active_activation() {
    let test_db = TestDb::new().await;
    let clock = Clock::fixed(1_700_000_000_000);
    let services = build_services(test_db.connection(), clock.clone());
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;
    let token = issue_token(&services, &device, &app.application_key, &app.application_secret).await;

    services
        .activations
        .block(&device.activation_id, None)
        .await
        .unwrap();

    let timestamp = clock.now_ms();
    let response = services
        .tokens
        .validate_token(&ValidateTokenRequest {
            token_id: token.token_id.clone(),
            token_digest: token_digest(&token.token_secret, "nonce-1", timestamp),
            nonce: "nonce-1".to_string(),
            timestamp,
        })
        .await
        .unwrap();
    assert!(!response.token_valid);

    // Creating a token against a blocked activation fails outright.
    let server_public = keys::public_key_from_base64(&device.payload.server_public_key).unwrap();
    let (envelope, _) = ecies::seal_request(&server_public, &app.application_secret, b"{}");
    let err = services
        .tokens
        .create_token(&CreateTokenRequest {
            activation_id: device.activation_id.clone(),
            application_key: app.application_key.clone(),
            signature_type: "POSSESSION".to_string(),
            envelope,
        })
        .await
        .expect_err("Token creation on blocked activation must fail");
    assert!(matches!(err, ServiceError::ActivationIncorrectState));
}

#[tokio::test]
async fn token_remove_is_scoped_to_activation() {
    let test_db = TestDb::new().await;
    let clock = Clock::fixed(1_700_000_000_000);
    let services = build_services(test_db.connection(), clock.clone());
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;
    let token = issue_token(&services, &device, &app.application_key, &app.application_secret).await;

    // Wrong activation ID does not remove the token.
    let response = services
        .tokens
        .remove_token(&token.token_id, "some-other-activation")
        .await
        .unwrap();
    assert!(!response.removed);

    let response = services
        .tokens
        .remove_token(&token.token_id, &device.activation_id)
        .await
        .unwrap();
    assert!(response.removed);

    let timestamp = clock.now_ms();
    let response = services
        .tokens
        .validate_token(&ValidateTokenRequest {
            token_id: token.token_id.clone(),
            token_digest: token_digest(&token.token_secret, "nonce-1", timestamp),
            nonce: "nonce-1".to_string(),
            timestamp,
        })
        .await
        .unwrap();
    assert!(!response.token_valid);
}

#[tokio::test]
async fn vault_unlock_releases_key_for_valid_signature() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "vault unlock request";
    let signature = device.sign(
        SignatureType::PossessionKnowledge,
        0,
        data.as_bytes(),
        &app.application_secret,
    );
    let response = services
        .vault
        .unlock(&VaultUnlockRequest {
            activation_id: device.activation_id.clone(),
            application_key: app.application_key.clone(),
            data: data.to_string(),
            signature,
            signature_type: "POSSESSION_KNOWLEDGE".to_string(),
            reason: Some("ADD_BIOMETRY".to_string()),
        })
        .await
        .unwrap();
    assert!(response.signature_valid);

    // The device unwraps the vault key with its transport key.
    let combined = Base64::decode_vec(response.encrypted_vault_encryption_key.as_deref().unwrap())
        .unwrap();
    let (iv, ciphertext) = combined.split_at(16);
    let transport_key = device.transport_key();
    let mut iv_block = [0u8; 16];
    iv_block.copy_from_slice(iv);
    let unwrapped = Aes128CbcDec::new(&transport_key.into(), &iv_block.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .unwrap();
    let expected_vault_key = keys::derive_key(&device.master_secret, keys::KDF_VAULT);
    assert_eq!(unwrapped, expected_vault_key);

    // The unlock consumed a counter position.
    let record = storage::find_activation(&services.db, &device.activation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.counter, 1);
}

#[tokio::test]
async fn vault_unlock_rejects_invalid_signature() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let response = services
        .vault
        .unlock(&VaultUnlockRequest {
            activation_id: device.activation_id.clone(),
            application_key: app.application_key.clone(),
            data: "vault unlock request".to_string(),
            signature: "00000000-00000000".to_string(),
            signature_type: "POSSESSION_KNOWLEDGE".to_string(),
            reason: None,
        })
        .await
        .unwrap();
    assert!(!response.signature_valid);
    assert!(response.encrypted_vault_encryption_key.is_none());

    // The failed unlock counts as a failed signature attempt.
    let record = storage::find_activation(&services.db, &device.activation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.failed_attempts, 1);
}
