//! Preview Controller: per-pull-request preview environments on Kubernetes.
//!
//! Binds GitHub repositories as preview environments, receives CI callbacks
//! and pull-request webhooks, and keeps deployment rows, GitHub deployments,
//! PR comments and cluster namespaces consistent with each other.

mod config;
mod error;
mod metrics;
mod migration;
mod models;
mod routes;
mod schema;
mod services;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use clap::{Parser, ValueEnum};
use tower_http::trace::TraceLayer;

use crate::services::cluster::KubeClusters;
use crate::services::deployment_service::DeploymentOrchestrator;
use crate::services::environment_service::{BindSettings, EnvironmentManager};
use crate::services::github::client::GitHubClient;
use crate::services::github::installation::{AppTokenMinter, InstallationTokens};
use crate::services::github::SourceControl;
use crate::store::memory::MemoryStore;
use crate::store::postgres::{build_pool, PgStore};
use crate::store::Store;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreKind {
    Postgres,
    /// In-process tables, lost on restart. Local development only.
    Memory,
}

#[derive(Parser)]
#[command(name = "preview-controller", about = "Preview environment deployment controller")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "PREVIEW_PORT", default_value = "8080")]
    port: u16,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Store backend
    #[arg(long, value_enum, default_value = "postgres")]
    store: StoreKind,

    /// Maximum pooled database connections
    #[arg(long, env = "PREVIEW_DB_POOL_SIZE", default_value = "10")]
    pool_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    tracing::info!("Starting Preview Controller...");

    let config = config::PreviewConfig::from_env()?;

    let store: Arc<dyn Store> = match cli.store {
        StoreKind::Postgres => {
            let db_url = cli
                .database_url
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres store"))?;
            let pool = build_pool(&db_url, cli.pool_size)?;
            {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
                tracing::info!("Running preview migration...");
                migration::run_migration(&mut conn).await?;
                tracing::info!("Preview migration completed.");
            }
            Arc::new(PgStore::new(pool))
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store -- state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // GitHub
    let http = reqwest::Client::builder().timeout(config.http_timeout).build()?;
    let minter = AppTokenMinter::new(
        http,
        &config.github_api_url,
        config.github_app_id,
        &config.github_app_private_key,
    )?;
    let tokens = Arc::new(InstallationTokens::new(Arc::new(minter)));
    let scm: Arc<dyn SourceControl> = Arc::new(GitHubClient::new(
        &config.github_api_url,
        tokens,
        config.http_timeout,
        config.scm_max_attempts,
    )?);

    // Clusters
    let clusters = Arc::new(KubeClusters::new(config.cluster_contexts.clone(), config.http_timeout));

    let deployments = Arc::new(DeploymentOrchestrator::new(
        store.clone(),
        scm.clone(),
        clusters,
        config.update_retries,
    ));
    let environments = Arc::new(EnvironmentManager::new(
        store.clone(),
        scm,
        deployments.clone(),
        BindSettings {
            server_url: config.server_url.clone(),
            webhook_secret: config.github_webhook_secret.clone(),
            token_signing_key: config.token_signing_key.clone(),
        },
    ));

    let state = routes::AppState {
        environments,
        deployments,
        store,
        webhook_secret: config.github_webhook_secret.clone(),
    };

    let app = Router::new()
        .nest("/api", routes::preview_router(state))
        .layer(TraceLayer::new_for_http());

    // Initialize metrics
    metrics::init_metrics();

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Preview Controller listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
