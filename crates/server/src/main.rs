//! Cask server binary.

use anyhow::{Context, Result};
use cask_core::config::AppConfig;
use cask_server::{AppState, UploadReaper, create_router};
use cask_storage::{BackendHandle, StorageBackend};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cask - content-addressed workspace blob storage
#[derive(Parser, Debug)]
#[command(name = "caskd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CASK_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `CASK_` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    // CASK_CONFIG is just the path
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("CASK_") && key != "CASK_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: caskd --config /path/to/config.toml\n  \
             2. Environment variables: CASK_SERVER__BIND=0.0.0.0:8080 \
             CASK_STORAGE__TYPE=filesystem CASK_STORAGE__PATH=./data/blobs caskd\n\n\
             See config/server.example.toml for example configuration.\n\
             Set CASK_CONFIG env var to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("CASK_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Run the upload reaper forever on its configured interval.
fn spawn_reaper(reaper: UploadReaper) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = reaper.config().interval();
        tracing::info!(
            interval_secs = interval.as_secs(),
            ttl_secs = reaper.config().ttl_secs,
            "Upload reaper enabled"
        );

        loop {
            tokio::time::sleep(interval).await;

            match reaper.run(OffsetDateTime::now_utc()).await {
                Ok(stats) => tracing::info!(
                    processed = stats.processed,
                    aborted = stats.aborted,
                    deleted = stats.deleted,
                    errors = stats.errors,
                    "Upload reaper run finished"
                ),
                Err(e) => tracing::error!(error = %e, "Upload reaper run failed"),
            }
        }
    })
}

/// Reload the storage section of the config file on SIGHUP.
#[cfg(unix)]
fn spawn_reload_listener(config_path: String, storage: Arc<BackendHandle>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading storage configuration");
            let config = match load_config(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reload configuration, keeping current backend");
                    continue;
                }
            };
            if let Err(e) = storage.reconfigure(config.storage).await {
                tracing::error!(error = %e, "Failed to reconfigure storage, keeping current backend");
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_listener(_config_path: String, _storage: Arc<BackendHandle>) -> Result<()> {
    tracing::debug!("Storage reload on SIGHUP is only available on unix");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Startup banner
    tracing::info!("Cask v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    // Register Prometheus metrics
    cask_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    // Initialize storage backend
    let storage = Arc::new(BackendHandle::new(config.storage.clone()));
    let backend = storage
        .get()
        .await
        .context("failed to initialize storage")?;
    tracing::info!(backend = backend.backend_name(), "Storage backend initialized");

    // Verify storage connectivity before accepting requests.
    backend
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backend connectivity verified");

    // Initialize metadata store
    let metadata = cask_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    // Create application state (spawns the blob event worker)
    let state = AppState::new(config.clone(), storage.clone(), metadata);

    if config.reaper.enabled {
        let reaper = UploadReaper::new(state.blobs.clone(), config.reaper.clone());
        spawn_reaper(reaper);
    } else {
        tracing::info!("Upload reaper disabled");
    }

    spawn_reload_listener(args.config.clone(), storage)?;

    // Create router
    let app = create_router(state);

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
