mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use mitra_api::storage::Storage;
use mitra_api::{AppState, AppStateInner, build_router};
use mitra_db::Database;
use mitra_gateway::{Actions, Dispatcher};

use crate::config::ServerConfig;

const DEFAULT_LOG_FILTER: &str =
    "mitra_server=debug,mitra_api=debug,mitra_gateway=debug,mitra_db=info,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database and storage
    let db = Arc::new(Database::open(&config.db_path)?);
    let storage = Storage::new(config.upload_dir.clone()).await?;

    // Shared state
    let dispatcher = Dispatcher::new();
    let state: AppState = Arc::new(AppStateInner {
        actions: Actions::new(db, dispatcher),
        storage,
        jwt_secret: config.jwt_secret.clone(),
        public_url: config.public_url.clone(),
        heartbeat: config.heartbeat,
    });

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Mitra server listening on {}", addr);
    info!("Attachment links use {}", config.public_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
