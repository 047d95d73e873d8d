//! Quire gateway binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use quire_core::config::AppConfig;
use quire_metadata::{MemoryStore, MetadataStore};
use quire_server::{AppState, create_router, maintenance};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Connection setup bound for the remote generation endpoint.
const GENERATOR_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Quire - resumable uploads and generation tasks
#[derive(Parser, Debug)]
#[command(name = "quired")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "QUIRE_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Load configuration: optional TOML file, then `QUIRE_` environment overrides.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {path}, using defaults");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("QUIRE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quire v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    quire_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = quire_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());

    let generator =
        quire_engine::generator::from_config(&config.generation, GENERATOR_CONNECT_TIMEOUT)
            .context("failed to initialize generator")?;
    tracing::info!(generator = generator.name(), "Generator initialized");

    let state = AppState::new(config.clone(), storage, metadata, generator);
    let _maintenance = maintenance::spawn(state.clone());
    let tasks = state.tasks.clone();

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tasks.shutdown();
    Ok(())
}
