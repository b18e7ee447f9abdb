//! convsync-server binary entry point.
//!
//! Usage:
//! ```bash
//! convsync-server --config convsync.toml
//! ```

use anyhow::Context;
use convsync_server::cleanup::spawn_cleanup_task;
use convsync_server::config::Config;
use convsync_server::engine::HttpImEngine;
use convsync_server::http::{build_internal_router, build_router, health};
use convsync_server::server::SyncServer;
use convsync_server::storage::SqliteStorage;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convsync_server=info".into()),
        )
        .init();

    let config = load_config()?;
    health::init_start_time();

    let storage = SqliteStorage::new(&config.storage)
        .await
        .with_context(|| format!("opening database {}", config.storage.database.display()))?;
    let engine = HttpImEngine::new(&config.engine).context("building IM engine client")?;
    tracing::info!(
        engine = engine.base_url(),
        save_across_device = config.sync.save_across_device,
        "Starting convsync-server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let bind_address = config.server.bind_address.clone();
    let internal_bind_address = config.server.internal_bind_address.clone();
    let cleanup = config.cleanup.clone();
    let server = Arc::new(SyncServer::new(config, storage, Arc::new(engine)));
    let sweeper = spawn_cleanup_task(server.clone(), cleanup);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    let internal_listener = tokio::net::TcpListener::bind(&internal_bind_address)
        .await
        .with_context(|| format!("binding {internal_bind_address}"))?;
    tracing::info!(
        internal = %internal_bind_address,
        "Listening on {}",
        bind_address
    );

    tokio::try_join!(
        axum::serve(listener, build_router(server.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .into_future(),
        axum::serve(internal_listener, build_internal_router(server))
            .with_graceful_shutdown(shutdown_signal())
            .into_future(),
    )?;

    sweeper.abort();
    tracing::info!("Shut down");
    Ok(())
}

/// Config from `--config <path>`, or `convsync.toml` when present, or defaults.
fn load_config() -> anyhow::Result<Config> {
    match get_config_path() {
        Some(path) => Ok(Config::from_file(&path)?),
        None => {
            let fallback = PathBuf::from("convsync.toml");
            if fallback.exists() {
                Ok(Config::from_file(&fallback)?)
            } else {
                tracing::warn!("No config file found, using defaults");
                Ok(Config::default())
            }
        }
    }
}

fn get_config_path() -> Option<PathBuf> {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
