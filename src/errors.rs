use miette::Diagnostic;
use thiserror::Error;

/// Service error with a stable code surfaced in REST error envelopes.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("User ID was not provided")]
    #[diagnostic(code(keystone::no_user_id))]
    NoUserId,

    #[error("Application ID was not provided")]
    #[diagnostic(code(keystone::no_application_id))]
    NoApplicationId,

    #[error("Invalid request: {0}")]
    #[diagnostic(code(keystone::invalid_request))]
    InvalidRequest(String),

    #[error("Invalid key format: {0}")]
    #[diagnostic(code(keystone::invalid_key_format))]
    InvalidKeyFormat(String),

    #[error("Activation with given ID was not found")]
    #[diagnostic(code(keystone::activation_not_found))]
    ActivationNotFound,

    #[error("Activation is expired")]
    #[diagnostic(code(keystone::activation_expired))]
    ActivationExpired,

    #[error("Activation is in incorrect state for requested operation")]
    #[diagnostic(code(keystone::activation_incorrect_state))]
    ActivationIncorrectState,

    #[error("Unable to compute activation signature")]
    #[diagnostic(code(keystone::unable_to_compute_signature))]
    UnableToComputeSignature,

    #[error("Master key pair private key is invalid")]
    #[diagnostic(code(keystone::incorrect_master_keypair_private))]
    IncorrectMasterKeyPairPrivate,

    #[error("No master key pair found for application")]
    #[diagnostic(code(keystone::no_master_keypair))]
    NoMasterKeyPair,

    #[error("Cryptography error: {0}")]
    #[diagnostic(code(keystone::cryptography))]
    GenericCryptography(String),

    #[error("Unable to generate a unique activation ID")]
    #[diagnostic(code(keystone::unable_to_generate_activation_id))]
    UnableToGenerateActivationId,

    #[error("Unable to generate a unique activation code")]
    #[diagnostic(code(keystone::unable_to_generate_activation_code))]
    UnableToGenerateActivationCode,

    #[error("Unable to generate a unique token ID")]
    #[diagnostic(code(keystone::unable_to_generate_token_id))]
    UnableToGenerateTokenId,

    #[error("Unable to generate a unique recovery code")]
    #[diagnostic(code(keystone::unable_to_generate_recovery_code))]
    UnableToGenerateRecoveryCode,

    #[error("Invalid recovery code or PUK")]
    #[diagnostic(code(keystone::invalid_recovery_code))]
    InvalidRecoveryCode {
        /// Lowest still-valid PUK index, reported back for client UX.
        current_recovery_puk_index: Option<i64>,
    },

    #[error("Recovery code already exists for given user")]
    #[diagnostic(code(keystone::recovery_code_already_exists))]
    RecoveryCodeAlreadyExists,

    #[error("Row lock could not be acquired, retry the request")]
    #[diagnostic(code(keystone::concurrency))]
    Concurrency,

    #[error("Database error: {0}")]
    #[diagnostic(code(keystone::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("I/O error: {0}")]
    #[diagnostic(code(keystone::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(keystone::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(keystone::serde))]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    #[diagnostic(code(keystone::other))]
    Other(String),
}

impl ServiceError {
    /// Stable error code carried in the REST error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NoUserId => "NO_USER_ID",
            ServiceError::NoApplicationId => "NO_APPLICATION_ID",
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::InvalidKeyFormat(_) => "INVALID_KEY_FORMAT",
            ServiceError::ActivationNotFound => "ACTIVATION_NOT_FOUND",
            ServiceError::ActivationExpired => "ACTIVATION_EXPIRED",
            ServiceError::ActivationIncorrectState => "ACTIVATION_INCORRECT_STATE",
            ServiceError::UnableToComputeSignature => "UNABLE_TO_COMPUTE_SIGNATURE",
            ServiceError::IncorrectMasterKeyPairPrivate => "INCORRECT_MASTER_SERVER_KEYPAIR_PRIVATE",
            ServiceError::NoMasterKeyPair => "NO_MASTER_SERVER_KEYPAIR",
            ServiceError::GenericCryptography(_) => "GENERIC_CRYPTOGRAPHY_ERROR",
            ServiceError::UnableToGenerateActivationId => "UNABLE_TO_GENERATE_ACTIVATION_ID",
            ServiceError::UnableToGenerateActivationCode => "UNABLE_TO_GENERATE_SHORT_ACTIVATION_ID",
            ServiceError::UnableToGenerateTokenId => "UNABLE_TO_GENERATE_TOKEN_ID",
            ServiceError::UnableToGenerateRecoveryCode => "UNABLE_TO_GENERATE_RECOVERY_CODE",
            ServiceError::InvalidRecoveryCode { .. } => "INVALID_RECOVERY_CODE",
            ServiceError::RecoveryCodeAlreadyExists => "RECOVERY_CODE_ALREADY_EXISTS",
            ServiceError::Concurrency => "CONCURRENCY",
            ServiceError::Db(_)
            | ServiceError::Io(_)
            | ServiceError::Config(_)
            | ServiceError::Serde(_)
            | ServiceError::Other(_) => "GENERIC_ERROR",
        }
    }

    /// Transient errors may be retried by the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Concurrency)
    }
}

/// Known error codes with human-readable descriptions, served by the
/// error-code listing endpoint.
pub fn error_code_list() -> Vec<(&'static str, &'static str)> {
    vec![
        ("NO_USER_ID", "User ID was not provided"),
        ("NO_APPLICATION_ID", "Application ID was not provided"),
        ("INVALID_REQUEST", "Request failed validation"),
        ("INVALID_KEY_FORMAT", "Provided key has an invalid format"),
        ("ACTIVATION_NOT_FOUND", "Activation with given ID was not found"),
        ("ACTIVATION_EXPIRED", "Activation is expired"),
        (
            "ACTIVATION_INCORRECT_STATE",
            "Activation is in incorrect state for requested operation",
        ),
        (
            "UNABLE_TO_COMPUTE_SIGNATURE",
            "Unable to compute activation signature",
        ),
        (
            "INCORRECT_MASTER_SERVER_KEYPAIR_PRIVATE",
            "Master key pair private key is invalid",
        ),
        (
            "NO_MASTER_SERVER_KEYPAIR",
            "No master key pair found for application",
        ),
        ("GENERIC_CRYPTOGRAPHY_ERROR", "Cryptography operation failed"),
        (
            "UNABLE_TO_GENERATE_ACTIVATION_ID",
            "Unable to generate a unique activation ID",
        ),
        (
            "UNABLE_TO_GENERATE_SHORT_ACTIVATION_ID",
            "Unable to generate a unique activation code",
        ),
        (
            "UNABLE_TO_GENERATE_TOKEN_ID",
            "Unable to generate a unique token ID",
        ),
        (
            "UNABLE_TO_GENERATE_RECOVERY_CODE",
            "Unable to generate a unique recovery code",
        ),
        ("INVALID_RECOVERY_CODE", "Invalid recovery code or PUK"),
        (
            "RECOVERY_CODE_ALREADY_EXISTS",
            "Recovery code already exists for given user",
        ),
        ("CONCURRENCY", "Row lock could not be acquired, retry the request"),
        ("GENERIC_ERROR", "Unknown error occurred"),
    ]
}
