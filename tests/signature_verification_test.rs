// Integration tests for the signature verifier: lookahead discipline,
// counter monotonicity, failed-attempt accounting with auto-block, and the
// offline payload builders.

mod helpers;

use base64ct::{Base64, Encoding};
use helpers::{activate_device, build_services, seed_application, ActivatedDevice, TestDb,
    TestServices};
use keystone::clock::Clock;
use keystone::crypto::keys;
use keystone::crypto::signature::{SignatureType, OFFLINE_APPLICATION_SECRET};
use keystone::signatures::{VerifyOfflineSignatureRequest, VerifySignatureRequest};
use keystone::storage;

fn verify_request(
    device: &ActivatedDevice,
    application_key: &str,
    signature: String,
    data: &str,
) -> VerifySignatureRequest {
    VerifySignatureRequest {
        activation_id: device.activation_id.clone(),
        data: data.to_string(),
        signature,
        signature_type: "POSSESSION".to_string(),
        application_key: application_key.to_string(),
    }
}

async fn counter_of(services: &TestServices, activation_id: &str) -> i64 {
    storage::find_activation(&services.db, activation_id)
        .await
        .unwrap()
        .unwrap()
        .counter
}

#[tokio::test]
async fn valid_signature_advances_counter() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "POST&/secure/payment&{\"amount\":100}";
    let signature = device.sign(SignatureType::Possession, 0, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, signature, data))
        .await
        .unwrap();

    assert!(response.signature_valid);
    assert_eq!(response.activation_status, "ACTIVE");
    assert_eq!(counter_of(&services, &device.activation_id).await, 1);
}

#[tokio::test]
async fn lookahead_accepts_counter_ahead_of_server() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    // Device skipped counters 0..2 and signs at 3; within lookahead of 20.
    let data = "data";
    let signature = device.sign(SignatureType::Possession, 3, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, signature, data))
        .await
        .unwrap();

    assert!(response.signature_valid);
    assert_eq!(counter_of(&services, &device.activation_id).await, 4);
}

#[tokio::test]
async fn signature_beyond_lookahead_is_rejected() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    let signature = device.sign(SignatureType::Possession, 21, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, signature, data))
        .await
        .unwrap();

    assert!(!response.signature_valid);
    assert_eq!(response.remaining_attempts, 4);
    assert_eq!(counter_of(&services, &device.activation_id).await, 0);
}

#[tokio::test]
async fn replayed_signature_is_rejected() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    let signature = device.sign(SignatureType::Possession, 0, data.as_bytes(), &app.application_secret);
    let first = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, signature.clone(), data))
        .await
        .unwrap();
    assert!(first.signature_valid);

    // The winning request invalidated every offset at or below its own.
    let replay = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, signature, data))
        .await
        .unwrap();
    assert!(!replay.signature_valid);
    assert_eq!(counter_of(&services, &device.activation_id).await, 1);
}

#[tokio::test]
async fn activation_blocks_at_failed_attempt_threshold() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    for attempt in 1..=5 {
        let response = services
            .signatures
            .verify(&verify_request(
                &device,
                &app.application_key,
                "00000000".to_string(),
                data,
            ))
            .await
            .unwrap();
        assert!(!response.signature_valid);
        if attempt < 5 {
            assert_eq!(response.activation_status, "ACTIVE");
            assert_eq!(response.remaining_attempts, 5 - attempt);
        } else {
            assert_eq!(response.activation_status, "BLOCKED");
            assert_eq!(response.blocked_reason.as_deref(), Some("MAX_FAILED_ATTEMPTS"));
            assert_eq!(response.remaining_attempts, 0);
        }
    }

    // A correct signature after the block is still invalid and does not
    // unblock or advance the counter.
    let good = device.sign(SignatureType::Possession, 0, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, good, data))
        .await
        .unwrap();
    assert!(!response.signature_valid);
    assert_eq!(response.activation_status, "BLOCKED");
    assert_eq!(counter_of(&services, &device.activation_id).await, 0);
}

#[tokio::test]
async fn successful_verification_resets_failed_attempts() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    for _ in 0..3 {
        services
            .signatures
            .verify(&verify_request(
                &device,
                &app.application_key,
                "00000000".to_string(),
                data,
            ))
            .await
            .unwrap();
    }
    let record = storage::find_activation(&services.db, &device.activation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.failed_attempts, 3);

    let good = device.sign(SignatureType::Possession, 0, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&verify_request(&device, &app.application_key, good, data))
        .await
        .unwrap();
    assert!(response.signature_valid);

    let record = storage::find_activation(&services.db, &device.activation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.failed_attempts, 0);
}

#[tokio::test]
async fn application_key_mismatch_rejects_without_accounting() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let other = seed_application(&services, "other-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    let signature = device.sign(SignatureType::Possession, 0, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&verify_request(&device, &other.application_key, signature, data))
        .await
        .unwrap();

    assert!(!response.signature_valid);
    let record = storage::find_activation(&services.db, &device.activation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.counter, 0);
    assert_eq!(record.failed_attempts, 0);
}

#[tokio::test]
async fn multi_factor_signature_verifies() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    let signature = device.sign(
        SignatureType::PossessionKnowledge,
        0,
        data.as_bytes(),
        &app.application_secret,
    );
    let response = services
        .signatures
        .verify(&VerifySignatureRequest {
            activation_id: device.activation_id.clone(),
            data: data.to_string(),
            signature,
            signature_type: "POSSESSION_KNOWLEDGE".to_string(),
            application_key: app.application_key.clone(),
        })
        .await
        .unwrap();
    assert!(response.signature_valid);

    // A single-factor signature does not satisfy a two-factor request.
    let single = device.sign(SignatureType::Possession, 1, data.as_bytes(), &app.application_secret);
    let response = services
        .signatures
        .verify(&VerifySignatureRequest {
            activation_id: device.activation_id.clone(),
            data: data.to_string(),
            signature: single,
            signature_type: "POSSESSION_KNOWLEDGE".to_string(),
            application_key: app.application_key.clone(),
        })
        .await
        .unwrap();
    assert!(!response.signature_valid);
}

#[tokio::test]
async fn every_attempt_is_audited() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "data";
    let good = device.sign(SignatureType::Possession, 0, data.as_bytes(), &app.application_secret);
    services
        .signatures
        .verify(&verify_request(&device, &app.application_key, good, data))
        .await
        .unwrap();
    services
        .signatures
        .verify(&verify_request(
            &device,
            &app.application_key,
            "00000000".to_string(),
            data,
        ))
        .await
        .unwrap();

    let audit = storage::list_signature_audit(&services.db, &device.activation_id)
        .await
        .unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].valid, 1);
    assert_eq!(audit[1].valid, 0);
    assert_eq!(audit[0].signature_type, "POSSESSION");
    assert!(!audit[0].data_hash.is_empty());
}

#[tokio::test]
async fn verification_against_unknown_activation_reports_removed() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    seed_application(&services, "demo-app").await;

    let response = services
        .signatures
        .verify(&VerifySignatureRequest {
            activation_id: "00000000-0000-0000-0000-000000000000".to_string(),
            data: "data".to_string(),
            signature: "00000000".to_string(),
            signature_type: "POSSESSION".to_string(),
            application_key: "whatever".to_string(),
        })
        .await
        .unwrap();
    assert!(!response.signature_valid);
    assert_eq!(response.activation_status, "REMOVED");
}

#[tokio::test]
async fn pending_activation_rejects_signatures() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;

    let init = services
        .activations
        .init(&keystone::activations::InitActivationRequest {
            application_id: app.application_id,
            user_id: "alice".to_string(),
            max_failed_attempts: None,
            timestamp_activation_expire: None,
        })
        .await
        .unwrap();

    let response = services
        .signatures
        .verify(&VerifySignatureRequest {
            activation_id: init.activation_id.clone(),
            data: "data".to_string(),
            signature: "00000000".to_string(),
            signature_type: "POSSESSION".to_string(),
            application_key: app.application_key.clone(),
        })
        .await
        .unwrap();
    assert!(!response.signature_valid);
    assert_eq!(response.activation_status, "CREATED");

    // State rejections leave an audit trail too.
    let audit = storage::list_signature_audit(&services.db, &init.activation_id)
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].valid, 0);
}

#[tokio::test]
async fn offline_signature_verifies_without_application_context() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let data = "offline payment data";
    let signature = device.sign(
        SignatureType::PossessionKnowledge,
        0,
        data.as_bytes(),
        OFFLINE_APPLICATION_SECRET,
    );
    let response = services
        .signatures
        .verify_offline(&VerifyOfflineSignatureRequest {
            activation_id: device.activation_id.clone(),
            data: data.to_string(),
            signature,
            signature_type: None,
        })
        .await
        .unwrap();
    assert!(response.signature_valid);
    assert_eq!(counter_of(&services, &device.activation_id).await, 1);
}

#[tokio::test]
async fn personalized_offline_payload_is_signed_by_server_key() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;
    let device = activate_device(&services, &app, "alice").await;

    let payload = services
        .signatures
        .create_personalized_offline_payload(&device.activation_id, "offline data")
        .await
        .unwrap();

    let lines: Vec<&str> = payload.offline_data.split('\n').collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "offline data");
    assert_eq!(lines[1], payload.nonce);

    let server_public = keys::public_key_from_base64(&device.payload.server_public_key).unwrap();
    let signed_part = format!("{}\n{}", lines[0], lines[1]);
    let signature = Base64::decode_vec(lines[2]).unwrap();
    assert!(keys::verify_data(signed_part.as_bytes(), &signature, &server_public));
}

#[tokio::test]
async fn non_personalized_offline_payload_is_signed_by_master_key() {
    let test_db = TestDb::new().await;
    let services = build_services(test_db.connection(), Clock::fixed(1_700_000_000_000));
    let app = seed_application(&services, "demo-app").await;

    let payload = services
        .signatures
        .create_non_personalized_offline_payload(app.application_id, "broadcast data")
        .await
        .unwrap();

    let lines: Vec<&str> = payload.offline_data.split('\n').collect();
    assert_eq!(lines.len(), 3);
    let signed_part = format!("{}\n{}", lines[0], lines[1]);
    let signature = Base64::decode_vec(lines[2]).unwrap();
    assert!(keys::verify_data(
        signed_part.as_bytes(),
        &signature,
        &app.master_public_key
    ));
}
