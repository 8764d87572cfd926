//! trayve-pipeline - AI fashion generation pipeline service
//!
//! Accepts generation batches over HTTP, debits merchant credits, runs every
//! pose through the tier's provider step chain in the background and
//! reconciles the ledger for poses that failed.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trayve_common::events::EventBus;

use trayve_pipeline::config::PipelineConfig;
use trayve_pipeline::services::{
    ArtifactStore, LocalBlobStorage, PipelineOrchestrator, ProviderRegistry, StepChainPolicy,
};
use trayve_pipeline::AppState;

#[derive(Debug, Parser)]
#[command(name = "trayve-pipeline", version, about)]
struct Args {
    /// Root folder holding the database and stored artifacts
    #[arg(long)]
    root_folder: Option<String>,

    /// Config file (defaults to the platform config location)
    #[arg(long, env = "TRAYVE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind address from the config file
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load config")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.base.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting trayve-pipeline");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let root_folder = trayve_common::config::resolve_root_folder(
        args.root_folder.as_deref(),
        trayve_common::config::ROOT_FOLDER_ENV,
        Some(&config.base),
    );
    let db_path = trayve_common::config::ensure_root_folder(&root_folder)
        .with_context(|| format!("Failed to initialize root folder {}", root_folder.display()))?;
    info!("Root folder: {}", root_folder.display());

    let db_pool = trayve_pipeline::db::init_database_pool(&db_path).await?;
    info!("Database: {}", db_path.display());

    let event_bus = EventBus::new(256);

    let artifacts_dir = root_folder.join("artifacts");
    let storage = LocalBlobStorage::new(artifacts_dir.clone(), &config.public_base_url())?;
    let providers = ProviderRegistry::from_config(&config.providers)?;

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        db_pool.clone(),
        event_bus.clone(),
        providers,
        ArtifactStore::new(Arc::new(storage)),
        StepChainPolicy::new(config.tiers.clone()),
        config.pricing.clone(),
        config.worker.max_concurrent_executions,
    ));

    let recovered = orchestrator.recover_interrupted_executions().await?;
    if recovered > 0 {
        info!(recovered, "Finished executions interrupted by the previous shutdown");
    }

    let state = AppState::new(db_pool, event_bus, orchestrator);
    let app = trayve_pipeline::build_router(state, &artifacts_dir);

    let bind_address = args
        .bind
        .unwrap_or_else(|| config.base.bind_address().to_string());
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    info!("Listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
