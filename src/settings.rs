use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub service: Service,
    #[serde(default)]
    pub crypto: Crypto,
    #[serde(default)]
    pub token: Token,
    #[serde(default)]
    pub recovery: Recovery,
    #[serde(default)]
    pub encryption: Encryption,
    #[serde(default)]
    pub callbacks: Callbacks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// SeaORM/SQLx connection string, e.g., sqlite://keystone.db?mode=rwc
    pub url: String,
}

/// Identity of this server instance, returned by the system-status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub application_name: String,
    pub application_display_name: String,
    pub application_environment: String,
    /// When true, REST callers must present integration credentials.
    pub restrict_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crypto {
    /// Retry budget when minting a unique activation ID.
    pub generate_activation_id_iterations: u32,
    /// Retry budget when minting a unique activation code.
    pub generate_activation_code_iterations: u32,
    pub generate_token_id_iterations: u32,
    pub generate_recovery_code_iterations: u32,
    /// Window from Init to Commit in milliseconds.
    pub activation_validity_ms: i64,
    /// Failed signature attempts before an activation is blocked.
    pub signature_max_failed_attempts: i64,
    /// Counter lookahead window for signature validation.
    pub signature_validation_lookahead: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Token digest freshness window in milliseconds.
    pub timestamp_validity_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recovery {
    /// Failed PUK attempts before a recovery code is blocked.
    pub max_failed_attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encryption {
    /// Base64-encoded master key for at-rest encryption of server private
    /// keys. Empty string disables encryption for newly written rows.
    pub master_db_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callbacks {
    pub connect_timeout_ms: u64,
    /// Bounded dispatcher queue; oldest pending events are dropped on overflow.
    pub queue_capacity: usize,
    /// Optional HTTP proxy for callback delivery, e.g. http://proxy:3128.
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://keystone.db?mode=rwc".to_string(),
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        Self {
            application_name: "keystone".to_string(),
            application_display_name: "Keystone Server".to_string(),
            application_environment: String::new(),
            restrict_access: false,
        }
    }
}

impl Default for Crypto {
    fn default() -> Self {
        Self {
            generate_activation_id_iterations: 10,
            generate_activation_code_iterations: 10,
            generate_token_id_iterations: 10,
            generate_recovery_code_iterations: 10,
            activation_validity_ms: 120_000,
            signature_max_failed_attempts: 5,
            signature_validation_lookahead: 20,
        }
    }
}

impl Default for Token {
    fn default() -> Self {
        Self {
            timestamp_validity_ms: 7_200_000,
        }
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
        }
    }
}

impl Default for Encryption {
    fn default() -> Self {
        Self {
            master_db_key: String::new(),
        }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            queue_capacity: 1_024,
            proxy_url: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file with environment overrides,
    /// e.g. KEYSTONE__SERVER__PORT=9090.
    pub fn load(path: &str) -> Result<Self, ServiceError> {
        let mut builder = config::Config::builder();

        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("KEYSTONE").separator("__"));

        let cfg = builder.build()?;
        let settings: Settings = cfg.try_deserialize()?;
        Ok(settings)
    }
}
