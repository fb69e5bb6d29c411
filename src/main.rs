use std::sync::Arc;

use clap::Parser;
use keystone::activations::ActivationService;
use keystone::applications::ApplicationService;
use keystone::callbacks::CallbackDispatcher;
use keystone::clock::Clock;
use keystone::key_at_rest::KeyAtRestCodec;
use keystone::recovery::RecoveryService;
use keystone::signatures::SignatureService;
use keystone::tokens::TokenService;
use keystone::vault::VaultService;
use keystone::{jobs, settings, storage, web};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "keystone",
    version,
    about = "Mobile device activation and request-authentication server"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config).into_diagnostic()?;
    tracing::info!(
        application = %settings.service.application_name,
        environment = %settings.service.application_environment,
        "Loaded configuration"
    );

    // init storage (database)
    let db = storage::init(&settings.database).await.into_diagnostic()?;
    tracing::info!("Database schema ready");

    let settings = Arc::new(settings);
    let codec = Arc::new(
        KeyAtRestCodec::from_master_key(&settings.encryption.master_db_key).into_diagnostic()?,
    );
    if codec.encryption_enabled() {
        tracing::info!("Server private keys are encrypted at rest");
    }

    let clock = Clock::system();
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
        callbacks.clone(),
        clock.clone(),
        activations.clone(),
        applications.clone(),
    );

    // init and start background job scheduler
    let _scheduler = jobs::init_scheduler(activations.clone())
        .await
        .into_diagnostic()?;

    let state = web::AppState {
        settings,
        db,
        clock,
        applications,
        activations,
        signatures,
        tokens,
        vault,
        recovery,
    };
    web::serve(state).await.into_diagnostic()?;

    Ok(())
}
