//! REST surface.
//!
//! Every operation is a POST with a JSON body, and every response is
//! wrapped in the uniform envelope `{status, responseObject|responseError}`.
//! Service errors render as HTTP 400 with their stable code; failed
//! signature or token validations are normal OK responses carrying a
//! negative result. When access is restricted, callers authenticate with
//! HTTP Basic credentials checked against the integration table.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64ct::{Base64, Encoding};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::activations::{ActivationService, CreateActivationRequest, InitActivationRequest,
    PrepareActivationRequest};
use crate::applications::ApplicationService;
use crate::clock::Clock;
use crate::errors::{error_code_list, ServiceError};
use crate::recovery::{ConfirmRecoveryCodeRequest, CreateRecoveryCodeRequest,
    LookupRecoveryCodesRequest, RecoveryCodeActivationRequest, RecoveryService,
    RevokeRecoveryCodesRequest};
use crate::settings::Settings;
use crate::signatures::{SignatureService, VerifyOfflineSignatureRequest, VerifySignatureRequest};
use crate::storage;
use crate::tokens::{CreateTokenRequest, TokenService, ValidateTokenRequest};
use crate::vault::{VaultService, VaultUnlockRequest};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub clock: Clock,
    pub applications: ApplicationService,
    pub activations: ActivationService,
    pub signatures: SignatureService,
    pub tokens: TokenService,
    pub vault: VaultService,
    pub recovery: RecoveryService,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OkEnvelope<T: Serialize> {
    status: &'static str,
    response_object: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    status: &'static str,
    response_error: Vec<ErrorItem>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorItem {
    code: String,
    message: String,
    localized_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_recovery_puk_index: Option<i64>,
}

fn ok<T: Serialize>(value: T) -> Response {
    Json(OkEnvelope {
        status: "OK",
        response_object: value,
    })
    .into_response()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let current_recovery_puk_index = match &self {
            ServiceError::InvalidRecoveryCode {
                current_recovery_puk_index,
            } => *current_recovery_puk_index,
            _ => None,
        };
        let message = self.to_string();
        let body = ErrorEnvelope {
            status: "ERROR",
            response_error: vec![ErrorItem {
                code: self.code().to_string(),
                localized_message: message.clone(),
                message,
                current_recovery_puk_index,
            }],
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

// --- authentication ---

async fn integration_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    if !state.settings.service.restrict_access {
        return Ok(next.run(request).await);
    }

    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorEnvelope {
                status: "ERROR",
                response_error: vec![ErrorItem {
                    code: "INVALID_REQUEST".to_string(),
                    message: "Integration credentials are required".to_string(),
                    localized_message: "Integration credentials are required".to_string(),
                    current_recovery_puk_index: None,
                }],
            }),
        )
            .into_response()
    };

    let Some(authorization) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(unauthorized());
    };
    let Some(encoded) = authorization.strip_prefix("Basic ") else {
        return Err(unauthorized());
    };
    let Ok(decoded) = Base64::decode_vec(encoded) else {
        return Err(unauthorized());
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return Err(unauthorized());
    };
    let Some((client_token, client_secret)) = credentials.split_once(':') else {
        return Err(unauthorized());
    };

    let integration = storage::find_integration_by_token(&state.db, client_token)
        .await
        .ok()
        .flatten();
    let Some(integration) = integration else {
        return Err(unauthorized());
    };
    let matches: bool = integration
        .client_secret
        .as_bytes()
        .ct_eq(client_secret.as_bytes())
        .into();
    if !matches {
        return Err(unauthorized());
    }
    Ok(next.run(request).await)
}

// --- request DTOs local to the boundary ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateApplicationRequest {
    application_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationIdRequest {
    application_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVersionRequest {
    application_id: i64,
    application_version_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionIdRequest {
    application_version_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivationIdRequest {
    activation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockActivationRequest {
    activation_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivationListRequest {
    user_id: String,
    #[serde(default)]
    application_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonalizedOfflinePayloadRequest {
    activation_id: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonPersonalizedOfflinePayloadRequest {
    application_id: i64,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveTokenRequest {
    token_id: String,
    activation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIntegrationRequest {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveIntegrationRequest {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCallbackRequest {
    application_id: i64,
    name: String,
    callback_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveCallbackRequest {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRecoveryConfigRequest {
    application_id: i64,
    activation_recovery_enabled: bool,
    #[serde(default)]
    recovery_postcard_enabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemStatusResponse {
    application_name: String,
    application_display_name: String,
    application_environment: String,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorCodeItem {
    code: &'static str,
    message: &'static str,
}

// --- handlers ---

async fn system_status(State(state): State<AppState>) -> Response {
    ok(SystemStatusResponse {
        application_name: state.settings.service.application_name.clone(),
        application_display_name: state.settings.service.application_display_name.clone(),
        application_environment: state.settings.service.application_environment.clone(),
        timestamp: state.clock.now_ms(),
    })
}

async fn error_list() -> Response {
    let items: Vec<ErrorCodeItem> = error_code_list()
        .into_iter()
        .map(|(code, message)| ErrorCodeItem { code, message })
        .collect();
    ok(items)
}

async fn application_create(
    State(state): State<AppState>,
    Json(request): Json<CreateApplicationRequest>,
) -> Result<Response, ServiceError> {
    let application = state
        .applications
        .create_application(&request.application_name)
        .await?;
    Ok(ok(application))
}

async fn application_list(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(ok(state.applications.list_applications().await?))
}

async fn application_detail(
    State(state): State<AppState>,
    Json(request): Json<ApplicationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .applications
        .application_detail(request.application_id)
        .await?))
}

async fn version_create(
    State(state): State<AppState>,
    Json(request): Json<CreateVersionRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .applications
        .create_version(request.application_id, &request.application_version_name)
        .await?))
}

async fn version_support(
    State(state): State<AppState>,
    Json(request): Json<VersionIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .applications
        .set_version_supported(request.application_version_id, true)
        .await?))
}

async fn version_unsupport(
    State(state): State<AppState>,
    Json(request): Json<VersionIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .applications
        .set_version_supported(request.application_version_id, false)
        .await?))
}

async fn activation_init(
    State(state): State<AppState>,
    Json(request): Json<InitActivationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.activations.init(&request).await?))
}

async fn activation_prepare(
    State(state): State<AppState>,
    Json(request): Json<PrepareActivationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.activations.prepare(&request).await?))
}

async fn activation_create(
    State(state): State<AppState>,
    Json(request): Json<CreateActivationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.activations.create(&request).await?))
}

async fn activation_commit(
    State(state): State<AppState>,
    Json(request): Json<ActivationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.activations.commit(&request.activation_id).await?))
}

async fn activation_status(
    State(state): State<AppState>,
    Json(request): Json<ActivationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .activations
        .get_status(&request.activation_id)
        .await?))
}

async fn activation_block(
    State(state): State<AppState>,
    Json(request): Json<BlockActivationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .activations
        .block(&request.activation_id, request.reason)
        .await?))
}

async fn activation_unblock(
    State(state): State<AppState>,
    Json(request): Json<ActivationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.activations.unblock(&request.activation_id).await?))
}

async fn activation_remove(
    State(state): State<AppState>,
    Json(request): Json<ActivationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.activations.remove(&request.activation_id).await?))
}

async fn activation_list(
    State(state): State<AppState>,
    Json(request): Json<ActivationListRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .activations
        .get_activation_list(request.application_id, &request.user_id)
        .await?))
}

async fn signature_verify(
    State(state): State<AppState>,
    Json(request): Json<VerifySignatureRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.signatures.verify(&request).await?))
}

async fn signature_verify_offline(
    State(state): State<AppState>,
    Json(request): Json<VerifyOfflineSignatureRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.signatures.verify_offline(&request).await?))
}

async fn offline_personalized_payload(
    State(state): State<AppState>,
    Json(request): Json<PersonalizedOfflinePayloadRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .signatures
        .create_personalized_offline_payload(&request.activation_id, &request.data)
        .await?))
}

async fn offline_non_personalized_payload(
    State(state): State<AppState>,
    Json(request): Json<NonPersonalizedOfflinePayloadRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .signatures
        .create_non_personalized_offline_payload(request.application_id, &request.data)
        .await?))
}

async fn token_create(
    State(state): State<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.tokens.create_token(&request).await?))
}

async fn token_validate(
    State(state): State<AppState>,
    Json(request): Json<ValidateTokenRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.tokens.validate_token(&request).await?))
}

async fn token_remove(
    State(state): State<AppState>,
    Json(request): Json<RemoveTokenRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .tokens
        .remove_token(&request.token_id, &request.activation_id)
        .await?))
}

async fn vault_unlock(
    State(state): State<AppState>,
    Json(request): Json<VaultUnlockRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.vault.unlock(&request).await?))
}

async fn recovery_create(
    State(state): State<AppState>,
    Json(request): Json<CreateRecoveryCodeRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.recovery.create_recovery_code(&request).await?))
}

async fn recovery_confirm(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRecoveryCodeRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.recovery.confirm_recovery_code(&request).await?))
}

async fn recovery_lookup(
    State(state): State<AppState>,
    Json(request): Json<LookupRecoveryCodesRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.recovery.lookup_recovery_codes(&request).await?))
}

async fn recovery_revoke(
    State(state): State<AppState>,
    Json(request): Json<RevokeRecoveryCodesRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.recovery.revoke_recovery_codes(&request).await?))
}

async fn recovery_activation(
    State(state): State<AppState>,
    Json(request): Json<RecoveryCodeActivationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.recovery.recovery_code_activation(&request).await?))
}

async fn recovery_config_detail(
    State(state): State<AppState>,
    Json(request): Json<ApplicationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .recovery
        .get_recovery_config(request.application_id)
        .await?))
}

async fn recovery_config_update(
    State(state): State<AppState>,
    Json(request): Json<UpdateRecoveryConfigRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .recovery
        .update_recovery_config(
            request.application_id,
            request.activation_recovery_enabled,
            request.recovery_postcard_enabled,
        )
        .await?))
}

async fn integration_create(
    State(state): State<AppState>,
    Json(request): Json<CreateIntegrationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.applications.create_integration(&request.name).await?))
}

async fn integration_list(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(ok(state.applications.list_integrations().await?))
}

async fn integration_remove(
    State(state): State<AppState>,
    Json(request): Json<RemoveIntegrationRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.applications.remove_integration(&request.id).await?))
}

async fn callback_create(
    State(state): State<AppState>,
    Json(request): Json<CreateCallbackRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .applications
        .create_callback(request.application_id, &request.name, &request.callback_url)
        .await?))
}

async fn callback_list(
    State(state): State<AppState>,
    Json(request): Json<ApplicationIdRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state
        .applications
        .list_callbacks(request.application_id)
        .await?))
}

async fn callback_remove(
    State(state): State<AppState>,
    Json(request): Json<RemoveCallbackRequest>,
) -> Result<Response, ServiceError> {
    Ok(ok(state.applications.remove_callback(&request.id).await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rest/v3/status", post(system_status).get(system_status))
        .route("/rest/v3/error/list", post(error_list).get(error_list))
        .route("/rest/v3/application/create", post(application_create))
        .route("/rest/v3/application/list", post(application_list))
        .route("/rest/v3/application/detail", post(application_detail))
        .route("/rest/v3/application/version/create", post(version_create))
        .route("/rest/v3/application/version/support", post(version_support))
        .route("/rest/v3/application/version/unsupport", post(version_unsupport))
        .route("/rest/v3/activation/init", post(activation_init))
        .route("/rest/v3/activation/prepare", post(activation_prepare))
        .route("/rest/v3/activation/create", post(activation_create))
        .route("/rest/v3/activation/commit", post(activation_commit))
        .route("/rest/v3/activation/status", post(activation_status))
        .route("/rest/v3/activation/block", post(activation_block))
        .route("/rest/v3/activation/unblock", post(activation_unblock))
        .route("/rest/v3/activation/remove", post(activation_remove))
        .route("/rest/v3/activation/list", post(activation_list))
        .route("/rest/v3/signature/verify", post(signature_verify))
        .route("/rest/v3/signature/offline/verify", post(signature_verify_offline))
        .route(
            "/rest/v3/signature/offline/personalized/create",
            post(offline_personalized_payload),
        )
        .route(
            "/rest/v3/signature/offline/non-personalized/create",
            post(offline_non_personalized_payload),
        )
        .route("/rest/v3/token/create", post(token_create))
        .route("/rest/v3/token/validate", post(token_validate))
        .route("/rest/v3/token/remove", post(token_remove))
        .route("/rest/v3/vault/unlock", post(vault_unlock))
        .route("/rest/v3/recovery/create", post(recovery_create))
        .route("/rest/v3/recovery/confirm", post(recovery_confirm))
        .route("/rest/v3/recovery/lookup", post(recovery_lookup))
        .route("/rest/v3/recovery/revoke", post(recovery_revoke))
        .route("/rest/v3/recovery/activation", post(recovery_activation))
        .route("/rest/v3/recovery/config/detail", post(recovery_config_detail))
        .route("/rest/v3/recovery/config/update", post(recovery_config_update))
        .route("/rest/v3/integration/create", post(integration_create))
        .route("/rest/v3/integration/list", post(integration_list))
        .route("/rest/v3/integration/remove", post(integration_remove))
        .route("/rest/v3/application/callback/create", post(callback_create))
        .route("/rest/v3/application/callback/list", post(callback_list))
        .route("/rest/v3/application/callback/remove", post(callback_remove))
        .layer(middleware::from_fn_with_state(state.clone(), integration_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> Result<(), ServiceError> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|err| ServiceError::InvalidRequest(format!("bad listen address: {err}")))?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "REST API listening");
    axum::serve(listener, app)
        .await
        .map_err(ServiceError::Io)?;
    Ok(())
}
