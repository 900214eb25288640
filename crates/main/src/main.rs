//! 主应用程序入口
//!
//! 加载配置、组装存储，启动 Axum 服务和后台清理任务。

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use application::{Clock, MaintenanceSweeper, SystemClock};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    tracing::info!(config = %config.sanitize(), "configuration loaded");

    let infrastructure = Infrastructure::connect(&config)
        .await
        .context("failed to initialise storage")?;
    tracing::info!(
        identities = infrastructure.directory.len().await,
        "identity directory ready"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(&config, &infrastructure, clock.clone());

    let shutdown = CancellationToken::new();
    let sweeper = Arc::new(MaintenanceSweeper::new(
        infrastructure.revocations.clone(),
        infrastructure.rate_windows.clone(),
        infrastructure.idempotency.clone(),
        clock,
    ));
    let sweeper_task = sweeper.spawn(
        Duration::from_secs(config.maintenance.sweep_interval_seconds),
        shutdown.clone(),
    );

    let app = router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!(address = %address, "community hub listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    sweeper_task.await.ok();
    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("shutdown signal received");
}
