//! Application, application-version and integration management, plus the
//! process-wide credential cache keyed by `application_key`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::keys;
use crate::entities::{application, application_callback, application_version, integration,
    master_key_pair};
use crate::errors::ServiceError;
use crate::storage;

/// Cached `(application_id, application_secret, supported)` tuple for one
/// application version.
#[derive(Clone, Debug)]
pub struct AppCredentials {
    pub application_id: i64,
    pub application_secret: String,
    pub supported: bool,
}

#[derive(Clone)]
pub struct ApplicationService {
    db: DatabaseConnection,
    clock: Clock,
    credential_cache: Arc<RwLock<HashMap<String, AppCredentials>>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDetailResponse {
    pub application_id: i64,
    pub application_name: String,
    pub master_public_key: String,
    pub versions: Vec<ApplicationVersionItem>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationVersionItem {
    pub application_version_id: i64,
    pub application_version_name: String,
    pub application_key: String,
    pub application_secret: String,
    pub supported: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationItem {
    pub id: String,
    pub name: String,
    pub client_token: String,
    pub client_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackItem {
    pub id: String,
    pub application_id: i64,
    pub name: String,
    pub callback_url: String,
}

fn random_credential() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    Base64::encode_string(&bytes)
}

impl ApplicationService {
    pub fn new(db: DatabaseConnection, clock: Clock) -> Self {
        Self {
            db,
            clock,
            credential_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create an application with an initial "default" version and its first
    /// master key pair, so activations can be initialized right away.
    pub async fn create_application(&self, name: &str) -> Result<application::Model, ServiceError> {
        if name.is_empty() {
            return Err(ServiceError::InvalidRequest("application name is required".into()));
        }
        if storage::find_application_by_name(&self.db, name).await?.is_some() {
            return Err(ServiceError::InvalidRequest(format!(
                "application already exists: {name}"
            )));
        }

        let app = application::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
        }
        .insert(&self.db)
        .await?;

        let version = application_version::ActiveModel {
            id: NotSet,
            application_id: Set(app.id),
            name: Set("default".to_string()),
            application_key: Set(random_credential()),
            application_secret: Set(random_credential()),
            supported: Set(1),
        }
        .insert(&self.db)
        .await?;
        self.invalidate_credentials(&version.application_key);

        let pair = keys::generate_key_pair();
        master_key_pair::ActiveModel {
            id: NotSet,
            application_id: Set(app.id),
            name: Set(format!("{name} default keypair")),
            master_key_private: Set(keys::private_key_to_base64(&pair.private)),
            master_key_public: Set(keys::public_key_to_base64(&pair.public)),
            timestamp_created: Set(self.clock.now_ms()),
        }
        .insert(&self.db)
        .await?;

        Ok(app)
    }

    pub async fn list_applications(&self) -> Result<Vec<application::Model>, ServiceError> {
        storage::list_applications(&self.db).await
    }

    pub async fn application_detail(
        &self,
        application_id: i64,
    ) -> Result<ApplicationDetailResponse, ServiceError> {
        let app = storage::find_application(&self.db, application_id)
            .await?
            .ok_or(ServiceError::NoApplicationId)?;
        let master_key_pair = storage::find_current_master_key_pair(&self.db, application_id)
            .await?
            .ok_or(ServiceError::NoMasterKeyPair)?;
        let versions = storage::list_versions_for_application(&self.db, application_id).await?;
        Ok(ApplicationDetailResponse {
            application_id: app.id,
            application_name: app.name,
            master_public_key: master_key_pair.master_key_public,
            versions: versions
                .into_iter()
                .map(|v| ApplicationVersionItem {
                    application_version_id: v.id,
                    application_version_name: v.name,
                    application_key: v.application_key,
                    application_secret: v.application_secret,
                    supported: v.supported != 0,
                })
                .collect(),
        })
    }

    pub async fn create_version(
        &self,
        application_id: i64,
        name: &str,
    ) -> Result<ApplicationVersionItem, ServiceError> {
        storage::find_application(&self.db, application_id)
            .await?
            .ok_or(ServiceError::NoApplicationId)?;
        let version = application_version::ActiveModel {
            id: NotSet,
            application_id: Set(application_id),
            name: Set(name.to_string()),
            application_key: Set(random_credential()),
            application_secret: Set(random_credential()),
            supported: Set(1),
        }
        .insert(&self.db)
        .await?;
        self.invalidate_credentials(&version.application_key);
        Ok(ApplicationVersionItem {
            application_version_id: version.id,
            application_version_name: version.name,
            application_key: version.application_key,
            application_secret: version.application_secret,
            supported: true,
        })
    }

    pub async fn set_version_supported(
        &self,
        version_id: i64,
        supported: bool,
    ) -> Result<ApplicationVersionItem, ServiceError> {
        let version = storage::find_application_version(&self.db, version_id)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidRequest(format!("unknown application version: {version_id}"))
            })?;
        let application_key = version.application_key.clone();
        let mut active: application_version::ActiveModel = version.into();
        active.supported = Set(if supported { 1 } else { 0 });
        let updated = active.update(&self.db).await?;
        self.invalidate_credentials(&application_key);
        Ok(ApplicationVersionItem {
            application_version_id: updated.id,
            application_version_name: updated.name,
            application_key: updated.application_key,
            application_secret: updated.application_secret,
            supported: updated.supported != 0,
        })
    }

    /// Resolve credentials for an application key, served from the cache
    /// when possible. Unknown keys are not negatively cached.
    pub async fn lookup_credentials(
        &self,
        application_key: &str,
    ) -> Result<Option<AppCredentials>, ServiceError> {
        if let Some(hit) = self
            .credential_cache
            .read()
            .expect("credential cache poisoned")
            .get(application_key)
        {
            return Ok(Some(hit.clone()));
        }
        let Some(version) = storage::find_version_by_application_key(&self.db, application_key).await?
        else {
            return Ok(None);
        };
        let credentials = AppCredentials {
            application_id: version.application_id,
            application_secret: version.application_secret,
            supported: version.supported != 0,
        };
        self.credential_cache
            .write()
            .expect("credential cache poisoned")
            .insert(application_key.to_string(), credentials.clone());
        Ok(Some(credentials))
    }

    fn invalidate_credentials(&self, application_key: &str) {
        self.credential_cache
            .write()
            .expect("credential cache poisoned")
            .remove(application_key);
    }

    // --- integrations ---

    pub async fn create_integration(&self, name: &str) -> Result<IntegrationItem, ServiceError> {
        let record = integration::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            name: Set(name.to_string()),
            client_token: Set(random_credential()),
            client_secret: Set(random_credential()),
        }
        .insert(&self.db)
        .await?;
        Ok(IntegrationItem {
            id: record.id,
            name: record.name,
            client_token: record.client_token,
            client_secret: record.client_secret,
        })
    }

    pub async fn list_integrations(&self) -> Result<Vec<IntegrationItem>, ServiceError> {
        Ok(storage::list_integrations(&self.db)
            .await?
            .into_iter()
            .map(|record| IntegrationItem {
                id: record.id,
                name: record.name,
                client_token: record.client_token,
                client_secret: record.client_secret,
            })
            .collect())
    }

    pub async fn remove_integration(&self, id: &str) -> Result<bool, ServiceError> {
        storage::remove_integration(&self.db, id).await
    }

    // --- callback URLs ---

    pub async fn create_callback(
        &self,
        application_id: i64,
        name: &str,
        callback_url: &str,
    ) -> Result<CallbackItem, ServiceError> {
        storage::find_application(&self.db, application_id)
            .await?
            .ok_or(ServiceError::NoApplicationId)?;
        if callback_url.is_empty() {
            return Err(ServiceError::InvalidRequest("callback URL is required".into()));
        }
        let record = application_callback::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            application_id: Set(application_id),
            name: Set(name.to_string()),
            callback_url: Set(callback_url.to_string()),
        }
        .insert(&self.db)
        .await?;
        Ok(CallbackItem {
            id: record.id,
            application_id: record.application_id,
            name: record.name,
            callback_url: record.callback_url,
        })
    }

    pub async fn list_callbacks(
        &self,
        application_id: i64,
    ) -> Result<Vec<CallbackItem>, ServiceError> {
        Ok(storage::list_callbacks_for_application(&self.db, application_id)
            .await?
            .into_iter()
            .map(|record| CallbackItem {
                id: record.id,
                application_id: record.application_id,
                name: record.name,
                callback_url: record.callback_url,
            })
            .collect())
    }

    pub async fn remove_callback(&self, id: &str) -> Result<bool, ServiceError> {
        storage::remove_callback(&self.db, id).await
    }
}
