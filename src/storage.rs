//! Schema bootstrap and the typed repository facade.
//!
//! All lookup/mutation helpers are generic over [`ConnectionTrait`] so they
//! participate in whatever transaction the caller opened. Reads that precede
//! a mutation go through the `_for_update` variants, which add a row-level
//! exclusive lock on engines that support it; SQLite serializes writers
//! internally, so the lock clause is skipped there. Lock-wait failures
//! surface as the transient `CONCURRENCY` error.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr,
    EntityTrait, Order, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
};

use crate::entities::activation::ActivationStatus;
use crate::entities::{self, activation, application, application_callback, application_version,
    integration, master_key_pair, recovery_code, recovery_config, recovery_puk, token};
use crate::errors::ServiceError;
use crate::settings::Database as DbCfg;

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, ServiceError> {
    let db = Database::connect(&cfg.url).await?;
    let backend = db.get_database_backend();

    if backend == DbBackend::Sqlite {
        db.execute(Statement::from_string(backend, "PRAGMA foreign_keys = ON"))
            .await?;
    }

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_application (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_application_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            application_key TEXT NOT NULL UNIQUE,
            application_secret TEXT NOT NULL,
            supported INTEGER NOT NULL DEFAULT 1
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_master_keypair (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            master_key_private TEXT NOT NULL,
            master_key_public TEXT NOT NULL,
            timestamp_created INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_activation (
            activation_id TEXT PRIMARY KEY,
            activation_code TEXT NOT NULL,
            activation_name TEXT,
            extras TEXT,
            user_id TEXT NOT NULL,
            application_id INTEGER NOT NULL,
            master_key_pair_id INTEGER NOT NULL,
            server_public_key TEXT NOT NULL,
            server_private_key TEXT NOT NULL,
            server_private_key_encryption INTEGER NOT NULL DEFAULT 0,
            device_public_key TEXT,
            counter INTEGER NOT NULL DEFAULT 0,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            max_failed_attempts INTEGER NOT NULL DEFAULT 5,
            status INTEGER NOT NULL,
            blocked_reason TEXT,
            timestamp_created INTEGER NOT NULL,
            timestamp_last_used INTEGER NOT NULL,
            timestamp_activation_expire INTEGER NOT NULL,
            version INTEGER
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        "CREATE INDEX IF NOT EXISTS idx_pa_activation_user ON pa_activation(user_id)",
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        "CREATE INDEX IF NOT EXISTS idx_pa_activation_code ON pa_activation(application_id, activation_code)",
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_activation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            activation_id TEXT NOT NULL,
            activation_status INTEGER NOT NULL,
            timestamp_created INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_signature_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            activation_id TEXT NOT NULL,
            activation_counter INTEGER NOT NULL,
            activation_status INTEGER NOT NULL,
            signature_type TEXT NOT NULL,
            data_hash TEXT NOT NULL,
            valid INTEGER NOT NULL,
            note TEXT,
            timestamp_created INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_integration (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            client_token TEXT NOT NULL UNIQUE,
            client_secret TEXT NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_application_callback (
            id TEXT PRIMARY KEY,
            application_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            callback_url TEXT NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_recovery_code (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            activation_id TEXT,
            recovery_code TEXT NOT NULL,
            status INTEGER NOT NULL,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            max_failed_attempts INTEGER NOT NULL DEFAULT 5,
            timestamp_created INTEGER NOT NULL,
            timestamp_last_used INTEGER
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        "CREATE INDEX IF NOT EXISTS idx_pa_recovery_code_user ON pa_recovery_code(application_id, user_id)",
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_recovery_puk (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recovery_code_id INTEGER NOT NULL,
            puk_index INTEGER NOT NULL,
            puk_hash TEXT NOT NULL,
            status INTEGER NOT NULL,
            timestamp_last_change INTEGER
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_recovery_config (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id INTEGER NOT NULL UNIQUE,
            activation_recovery_enabled INTEGER NOT NULL DEFAULT 0,
            recovery_postcard_enabled INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS pa_token (
            token_id TEXT PRIMARY KEY,
            token_secret TEXT NOT NULL,
            activation_id TEXT NOT NULL,
            signature_type TEXT NOT NULL,
            timestamp_created INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    Ok(db)
}

/// Lock-wait and busy errors are transient; the caller retries.
fn map_lock_error(err: DbErr) -> ServiceError {
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("lock") || text.contains("timeout") || text.contains("busy") {
        ServiceError::Concurrency
    } else {
        ServiceError::Db(err)
    }
}

fn supports_row_locks<C: ConnectionTrait>(db: &C) -> bool {
    db.get_database_backend() != DbBackend::Sqlite
}

// --- applications ---

pub async fn find_application<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<Option<application::Model>, ServiceError> {
    Ok(entities::Application::find_by_id(id).one(db).await?)
}

pub async fn find_application_by_name<C: ConnectionTrait>(
    db: &C,
    name: &str,
) -> Result<Option<application::Model>, ServiceError> {
    Ok(entities::Application::find()
        .filter(application::Column::Name.eq(name))
        .one(db)
        .await?)
}

pub async fn list_applications<C: ConnectionTrait>(
    db: &C,
) -> Result<Vec<application::Model>, ServiceError> {
    Ok(entities::Application::find()
        .order_by(application::Column::Id, Order::Asc)
        .all(db)
        .await?)
}

// --- application versions ---

pub async fn find_application_version<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<Option<application_version::Model>, ServiceError> {
    Ok(entities::ApplicationVersion::find_by_id(id).one(db).await?)
}

pub async fn find_version_by_application_key<C: ConnectionTrait>(
    db: &C,
    application_key: &str,
) -> Result<Option<application_version::Model>, ServiceError> {
    Ok(entities::ApplicationVersion::find()
        .filter(application_version::Column::ApplicationKey.eq(application_key))
        .one(db)
        .await?)
}

pub async fn list_versions_for_application<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
) -> Result<Vec<application_version::Model>, ServiceError> {
    Ok(entities::ApplicationVersion::find()
        .filter(application_version::Column::ApplicationId.eq(application_id))
        .order_by(application_version::Column::Id, Order::Asc)
        .all(db)
        .await?)
}

// --- master key pairs ---

/// The latest key pair per application is the current one.
pub async fn find_current_master_key_pair<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
) -> Result<Option<master_key_pair::Model>, ServiceError> {
    Ok(entities::MasterKeyPair::find()
        .filter(master_key_pair::Column::ApplicationId.eq(application_id))
        .order_by(master_key_pair::Column::TimestampCreated, Order::Desc)
        .order_by(master_key_pair::Column::Id, Order::Desc)
        .one(db)
        .await?)
}

pub async fn find_master_key_pair<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<Option<master_key_pair::Model>, ServiceError> {
    Ok(entities::MasterKeyPair::find_by_id(id).one(db).await?)
}

// --- activations ---

pub async fn find_activation<C: ConnectionTrait>(
    db: &C,
    activation_id: &str,
) -> Result<Option<activation::Model>, ServiceError> {
    Ok(entities::Activation::find_by_id(activation_id).one(db).await?)
}

/// Load an activation under a row-level exclusive lock for mutation.
pub async fn find_activation_for_update<C: ConnectionTrait>(
    db: &C,
    activation_id: &str,
) -> Result<Option<activation::Model>, ServiceError> {
    let mut query = entities::Activation::find_by_id(activation_id);
    if supports_row_locks(db) {
        query = query.lock_exclusive();
    }
    query.one(db).await.map_err(map_lock_error)
}

pub async fn find_activations_for_user<C: ConnectionTrait>(
    db: &C,
    application_id: Option<i64>,
    user_id: &str,
) -> Result<Vec<activation::Model>, ServiceError> {
    let mut query = entities::Activation::find().filter(activation::Column::UserId.eq(user_id));
    if let Some(application_id) = application_id {
        query = query.filter(activation::Column::ApplicationId.eq(application_id));
    }
    Ok(query
        .order_by(activation::Column::TimestampCreated, Order::Asc)
        .all(db)
        .await?)
}

/// Find an unexpired activation by code within the given states, locked for
/// mutation. Used both for code-collision checks and the Prepare lookup.
pub async fn find_activation_by_code_for_update<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
    activation_code: &str,
    states: &[ActivationStatus],
    now_ms: i64,
) -> Result<Option<activation::Model>, ServiceError> {
    let state_tags: Vec<i64> = states.iter().map(|s| s.to_db()).collect();
    let mut query = entities::Activation::find()
        .filter(activation::Column::ApplicationId.eq(application_id))
        .filter(activation::Column::ActivationCode.eq(activation_code))
        .filter(activation::Column::Status.is_in(state_tags))
        .filter(activation::Column::TimestampActivationExpire.gt(now_ms));
    if supports_row_locks(db) {
        query = query.lock_exclusive();
    }
    query.one(db).await.map_err(map_lock_error)
}

/// Pending activations whose expiration timestamp has passed; used by the
/// background sweep.
pub async fn find_expired_pending_activations<C: ConnectionTrait>(
    db: &C,
    now_ms: i64,
    limit: u64,
) -> Result<Vec<activation::Model>, ServiceError> {
    Ok(entities::Activation::find()
        .filter(activation::Column::Status.is_in([
            ActivationStatus::Created.to_db(),
            ActivationStatus::OtpUsed.to_db(),
        ]))
        .filter(activation::Column::TimestampActivationExpire.lt(now_ms))
        .limit(limit)
        .all(db)
        .await?)
}

// --- history and audit ---

pub async fn insert_activation_history<C: ConnectionTrait>(
    db: &C,
    activation_id: &str,
    status: ActivationStatus,
    now_ms: i64,
) -> Result<(), ServiceError> {
    let record = entities::activation_history::ActiveModel {
        id: sea_orm::NotSet,
        activation_id: Set(activation_id.to_string()),
        activation_status: Set(status.to_db()),
        timestamp_created: Set(now_ms),
    };
    record.insert(db).await?;
    Ok(())
}

pub async fn list_activation_history<C: ConnectionTrait>(
    db: &C,
    activation_id: &str,
) -> Result<Vec<entities::activation_history::Model>, ServiceError> {
    Ok(entities::ActivationHistory::find()
        .filter(entities::activation_history::Column::ActivationId.eq(activation_id))
        .order_by(entities::activation_history::Column::Id, Order::Asc)
        .all(db)
        .await?)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_signature_audit<C: ConnectionTrait>(
    db: &C,
    activation_id: &str,
    activation_counter: i64,
    activation_status: ActivationStatus,
    signature_type: &str,
    data_hash: &str,
    valid: bool,
    note: Option<String>,
    now_ms: i64,
) -> Result<(), ServiceError> {
    let record = entities::signature_audit::ActiveModel {
        id: sea_orm::NotSet,
        activation_id: Set(activation_id.to_string()),
        activation_counter: Set(activation_counter),
        activation_status: Set(activation_status.to_db()),
        signature_type: Set(signature_type.to_string()),
        data_hash: Set(data_hash.to_string()),
        valid: Set(if valid { 1 } else { 0 }),
        note: Set(note),
        timestamp_created: Set(now_ms),
    };
    record.insert(db).await?;
    Ok(())
}

pub async fn list_signature_audit<C: ConnectionTrait>(
    db: &C,
    activation_id: &str,
) -> Result<Vec<entities::signature_audit::Model>, ServiceError> {
    Ok(entities::SignatureAudit::find()
        .filter(entities::signature_audit::Column::ActivationId.eq(activation_id))
        .order_by(entities::signature_audit::Column::Id, Order::Asc)
        .all(db)
        .await?)
}

// --- integrations ---

pub async fn find_integration_by_token<C: ConnectionTrait>(
    db: &C,
    client_token: &str,
) -> Result<Option<integration::Model>, ServiceError> {
    Ok(entities::Integration::find()
        .filter(integration::Column::ClientToken.eq(client_token))
        .one(db)
        .await?)
}

pub async fn list_integrations<C: ConnectionTrait>(
    db: &C,
) -> Result<Vec<integration::Model>, ServiceError> {
    Ok(entities::Integration::find().all(db).await?)
}

pub async fn remove_integration<C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<bool, ServiceError> {
    let result = entities::Integration::delete_by_id(id).exec(db).await?;
    Ok(result.rows_affected > 0)
}

// --- callback URLs ---

pub async fn list_callbacks_for_application<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
) -> Result<Vec<application_callback::Model>, ServiceError> {
    Ok(entities::ApplicationCallback::find()
        .filter(application_callback::Column::ApplicationId.eq(application_id))
        .all(db)
        .await?)
}

pub async fn remove_callback<C: ConnectionTrait>(db: &C, id: &str) -> Result<bool, ServiceError> {
    let result = entities::ApplicationCallback::delete_by_id(id).exec(db).await?;
    Ok(result.rows_affected > 0)
}

// --- recovery ---

pub async fn find_recovery_code_for_update<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
    recovery_code: &str,
) -> Result<Option<recovery_code::Model>, ServiceError> {
    let mut query = entities::RecoveryCode::find()
        .filter(recovery_code::Column::ApplicationId.eq(application_id))
        .filter(recovery_code::Column::RecoveryCode.eq(recovery_code));
    if supports_row_locks(db) {
        query = query.lock_exclusive();
    }
    query.one(db).await.map_err(map_lock_error)
}

pub async fn find_recovery_code_by_code<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
    recovery_code: &str,
) -> Result<Option<recovery_code::Model>, ServiceError> {
    Ok(entities::RecoveryCode::find()
        .filter(recovery_code::Column::ApplicationId.eq(application_id))
        .filter(recovery_code::Column::RecoveryCode.eq(recovery_code))
        .one(db)
        .await?)
}

/// A standalone (not activation-bound) code for a user in CREATED or ACTIVE
/// state; at most one may exist at a time.
pub async fn find_standalone_recovery_code_for_user<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
    user_id: &str,
) -> Result<Option<recovery_code::Model>, ServiceError> {
    use crate::entities::recovery_code::RecoveryCodeStatus;
    Ok(entities::RecoveryCode::find()
        .filter(recovery_code::Column::ApplicationId.eq(application_id))
        .filter(recovery_code::Column::UserId.eq(user_id))
        .filter(recovery_code::Column::ActivationId.is_null())
        .filter(recovery_code::Column::Status.is_in([
            RecoveryCodeStatus::Created.to_db(),
            RecoveryCodeStatus::Active.to_db(),
        ]))
        .one(db)
        .await?)
}

pub async fn lookup_recovery_codes<C: ConnectionTrait>(
    db: &C,
    application_id: Option<i64>,
    user_id: Option<&str>,
    activation_id: Option<&str>,
    status: Option<i64>,
) -> Result<Vec<recovery_code::Model>, ServiceError> {
    let mut query = entities::RecoveryCode::find();
    if let Some(application_id) = application_id {
        query = query.filter(recovery_code::Column::ApplicationId.eq(application_id));
    }
    if let Some(user_id) = user_id {
        query = query.filter(recovery_code::Column::UserId.eq(user_id));
    }
    if let Some(activation_id) = activation_id {
        query = query.filter(recovery_code::Column::ActivationId.eq(activation_id));
    }
    if let Some(status) = status {
        query = query.filter(recovery_code::Column::Status.eq(status));
    }
    Ok(query
        .order_by(recovery_code::Column::Id, Order::Asc)
        .all(db)
        .await?)
}

pub async fn find_recovery_code_by_id<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<Option<recovery_code::Model>, ServiceError> {
    Ok(entities::RecoveryCode::find_by_id(id).one(db).await?)
}

/// PUKs for a recovery code, ordered by index ascending.
pub async fn list_recovery_puks<C: ConnectionTrait>(
    db: &C,
    recovery_code_id: i64,
) -> Result<Vec<recovery_puk::Model>, ServiceError> {
    Ok(entities::RecoveryPuk::find()
        .filter(recovery_puk::Column::RecoveryCodeId.eq(recovery_code_id))
        .order_by(recovery_puk::Column::PukIndex, Order::Asc)
        .all(db)
        .await?)
}

pub async fn find_recovery_config<C: ConnectionTrait>(
    db: &C,
    application_id: i64,
) -> Result<Option<recovery_config::Model>, ServiceError> {
    Ok(entities::RecoveryConfig::find()
        .filter(recovery_config::Column::ApplicationId.eq(application_id))
        .one(db)
        .await?)
}

// --- tokens ---

pub async fn find_token<C: ConnectionTrait>(
    db: &C,
    token_id: &str,
) -> Result<Option<token::Model>, ServiceError> {
    Ok(entities::Token::find_by_id(token_id).one(db).await?)
}

pub async fn remove_token<C: ConnectionTrait>(
    db: &C,
    token_id: &str,
    activation_id: &str,
) -> Result<bool, ServiceError> {
    let result = entities::Token::delete_many()
        .filter(token::Column::TokenId.eq(token_id))
        .filter(token::Column::ActivationId.eq(activation_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}
