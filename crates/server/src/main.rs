use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Error as AnyhowError};
use db::DBService;
use server::{AppState, routes};
use services::services::config::{BridgeConfig, ConfigError};
use services::services::pass::SyncEngine;
use services::services::poll::PollDriver;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use trackers::{GitlabApi, GitlabClient, RedmineApi, RedmineClient};

#[derive(Debug, Error)]
pub enum TrackbridgeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), TrackbridgeError> {
    // Load .env file if present (for development)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = config_path();
    let config = BridgeConfig::load(&config_path)?;
    tracing::info!(config = %config_path.display(), "Configuration loaded");

    let db = DBService::new(&config.storage.connection_string).await?;

    // Construction graph: http clients -> adapters -> engine -> driver.
    let redmine: Arc<dyn RedmineApi> = Arc::new(
        RedmineClient::new(
            &config.redmine.base_url,
            &config.redmine.api_key,
            config.redmine.public_url.as_deref(),
        )
        .context("building Redmine client")?,
    );
    let gitlab: Arc<dyn GitlabApi> = Arc::new(
        GitlabClient::new(
            &config.gitlab.base_url,
            &config.gitlab.token,
            config.category_keys.clone(),
        )
        .context("building GitLab client")?,
    );

    let engine = Arc::new(SyncEngine::new(
        db.pool.clone(),
        redmine,
        gitlab,
        config.clone(),
    ));

    let driver = PollDriver::new(engine, &config.polling);
    let poll_status = driver.status_handle();
    let cancel = driver.cancellation_token();
    let driver_handle = if config.polling.enabled {
        Some(driver.spawn())
    } else {
        tracing::info!("Polling disabled by configuration");
        None
    };

    let app_router = routes::router(AppState { poll_status });

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(8220);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!("Server running on http://{host}:{port}");

    axum::serve(listener, app_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the driver first so no pass is mid-flight while the pool drains.
    cancel.cancel();
    if let Some(handle) = driver_handle {
        let _ = handle.await;
    }

    match sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&db.pool)
        .await
    {
        Ok(_) => tracing::info!("Final WAL checkpoint completed"),
        Err(e) => tracing::warn!("Final WAL checkpoint failed (data may still be in WAL): {}", e),
    }
    db.pool.close().await;

    Ok(())
}

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TRACKBRIDGE_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("trackbridge.json"))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
