use std::sync::Arc;

use keystone::activations::{ActivationPayload, ActivationService, InitActivationRequest,
    InitActivationResponse, PrepareActivationRequest};
use keystone::applications::ApplicationService;
use keystone::callbacks::CallbackDispatcher;
use keystone::clock::Clock;
use keystone::crypto::ecies;
use keystone::crypto::keys::{self, ServerKeyPair};
use keystone::crypto::signature::{compute_signature, derive_factor_keys, SignatureType};
use keystone::key_at_rest::KeyAtRestCodec;
use keystone::recovery::RecoveryService;
use keystone::settings::Settings;
use keystone::signatures::SignatureService;
use keystone::tokens::TokenService;
use keystone::vault::VaultService;
use sea_orm::DatabaseConnection;

/// Full service graph wired against a test database.
pub struct TestServices {
    pub db: DatabaseConnection,
    pub clock: Clock,
    pub settings: Arc<Settings>,
    pub applications: ApplicationService,
    pub activations: ActivationService,
    pub signatures: SignatureService,
    pub tokens: TokenService,
    pub vault: VaultService,
    pub recovery: RecoveryService,
}

pub fn build_services(db: DatabaseConnection, clock: Clock) -> TestServices {
    build_services_with(db, clock, Settings::default())
}

pub fn build_services_with(db: DatabaseConnection, clock: Clock, settings: Settings) -> TestServices {
    let settings = Arc::new(settings);
    let codec = Arc::new(
        KeyAtRestCodec::from_master_key(&settings.encryption.master_db_key)
            .expect("Failed to build key-at-rest codec"),
    );
    let callbacks = CallbackDispatcher::start(db.clone(), &settings.callbacks);
    let applications = ApplicationService::new(db.clone(), clock.clone());
    let activations = ActivationService::new(
        db.clone(),
        settings.clone(),
        codec.clone(),
        callbacks.clone(),
        clock.clone(),
        applications.clone(),
    );
    let signatures = SignatureService::new(
        db.clone(),
        settings.clone(),
        codec.clone(),
        callbacks.clone(),
        clock.clone(),
        applications.clone(),
    );
    let tokens = TokenService::new(
        db.clone(),
        settings.clone(),
        codec.clone(),
        clock.clone(),
        applications.clone(),
    );
    let vault = VaultService::new(db.clone(), codec.clone(), signatures.clone());
    let recovery = RecoveryService::new(
        db.clone(),
        settings.clone(),
        callbacks,
        clock.clone(),
        activations.clone(),
        applications.clone(),
    );
    TestServices {
        db,
        clock,
        settings,
        applications,
        activations,
        signatures,
        tokens,
        vault,
        recovery,
    }
}

/// A seeded application with its default version credentials and master
/// public key.
pub struct SeededApp {
    pub application_id: i64,
    pub application_key: String,
    pub application_secret: String,
    pub master_public_key: p256::PublicKey,
}

pub async fn seed_application(services: &TestServices, name: &str) -> SeededApp {
    let app = services
        .applications
        .create_application(name)
        .await
        .expect("Failed to create application");
    let detail = services
        .applications
        .application_detail(app.id)
        .await
        .expect("Failed to load application detail");
    let version = detail.versions.first().expect("Application has no version");
    SeededApp {
        application_id: app.id,
        application_key: version.application_key.clone(),
        application_secret: version.application_secret.clone(),
        master_public_key: keys::public_key_from_base64(&detail.master_public_key)
            .expect("Invalid master public key"),
    }
}

/// Device-side state of a completed activation.
pub struct ActivatedDevice {
    pub activation_id: String,
    pub init: InitActivationResponse,
    pub device: ServerKeyPair,
    pub master_secret: [u8; 32],
    pub payload: ActivationPayload,
}

impl ActivatedDevice {
    /// Compute a client-side signature at the given counter.
    pub fn sign(
        &self,
        signature_type: SignatureType,
        counter: u64,
        data: &[u8],
        application_secret: &str,
    ) -> String {
        let factor_keys = derive_factor_keys(&self.master_secret, signature_type);
        compute_signature(&factor_keys, counter, data, application_secret)
    }

    pub fn transport_key(&self) -> [u8; 16] {
        keys::derive_key(&self.master_secret, keys::KDF_TRANSPORT)
    }
}

/// Run the full Init -> Prepare -> Commit flow as a device would.
pub async fn activate_device(
    services: &TestServices,
    app: &SeededApp,
    user_id: &str,
) -> ActivatedDevice {
    let init = services
        .activations
        .init(&InitActivationRequest {
            application_id: app.application_id,
            user_id: user_id.to_string(),
            max_failed_attempts: None,
            timestamp_activation_expire: None,
        })
        .await
        .expect("Failed to init activation");

    let (device, payload) = prepare_device(services, app, &init.activation_code).await;

    services
        .activations
        .commit(&init.activation_id)
        .await
        .expect("Failed to commit activation");

    let server_public = keys::public_key_from_base64(&payload.server_public_key)
        .expect("Invalid server public key in payload");
    let master_secret = keys::shared_master_secret(&device.private, &server_public);

    ActivatedDevice {
        activation_id: init.activation_id.clone(),
        init,
        device,
        master_secret,
        payload,
    }
}

/// Run only the Prepare step with a fresh device key pair, returning the
/// device keys and the opened activation payload.
pub async fn prepare_device(
    services: &TestServices,
    app: &SeededApp,
    activation_code: &str,
) -> (ServerKeyPair, ActivationPayload) {
    let device = keys::generate_key_pair();
    let device_public_bytes = keys::public_key_to_bytes(&device.public);
    let (envelope, client_keys) = ecies::seal_request(
        &app.master_public_key,
        &app.application_secret,
        &device_public_bytes,
    );
    let prepared = services
        .activations
        .prepare(&PrepareActivationRequest {
            activation_code: activation_code.to_string(),
            application_key: app.application_key.clone(),
            activation_name: Some("test device".to_string()),
            extras: None,
            envelope,
        })
        .await
        .expect("Failed to prepare activation");
    let payload_bytes = ecies::open_with_keys(&client_keys, &prepared.envelope)
        .expect("Failed to open prepare response");
    let payload: ActivationPayload =
        serde_json::from_slice(&payload_bytes).expect("Invalid activation payload");
    (device, payload)
}
