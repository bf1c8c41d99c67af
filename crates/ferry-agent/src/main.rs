//! Ferry Agent - Main entry point

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use ferry_common::logging::{init_logging, LogConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ferry_agent::{
    api::{self, AppState},
    broadcast::Broadcaster,
    config::Config,
    db::LedgerStore,
    platform::HttpPlatform,
    storage::S3Uploader,
    upload::{SessionRegistry, UploadOrchestrator},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("ferry-agent")
        .filter_directives("ferry_agent=debug,tower_http=debug,sqlx=warn,aws_smithy_runtime=info")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting Ferry Agent");

    let config = Config::load()?;
    info!(
        "Configuration loaded - agent will bind to {}:{}",
        config.server.host, config.server.port
    );

    let ledger = LedgerStore::connect(&config.db_config()).await?;
    info!("Ledger ready");

    let uploader = S3Uploader::new(&config.storage).await;
    let platform = HttpPlatform::new(
        config.platform.url.clone(),
        config.platform.token.clone(),
        config.platform_timeout(),
    )?;

    let broadcaster = Broadcaster::new();
    let registry = SessionRegistry::new(broadcaster.clone());
    let orchestrator = UploadOrchestrator::new(
        ledger.clone(),
        Arc::new(platform),
        Arc::new(uploader),
        broadcaster.clone(),
        registry.clone(),
        config.pool_config(),
    );

    let state = AppState {
        ledger,
        orchestrator: orchestrator.clone(),
        broadcaster: broadcaster.clone(),
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Agent listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let stopping = CancellationToken::new();

    // Event streams never end on their own, so they are finished and every
    // upload is cancelled before the server waits on open connections
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let stopping = stopping.clone();
        async move {
            shutdown_signal().await;
            let finished = broadcaster.finish_all();
            let cancelled = registry.shutdown();
            info!(finished, cancelled, "Closed event streams and cancelled uploads");
            stopping.cancel();
        }
    });

    tokio::select! {
        result = async move { server.await } => result?,
        _ = async {
            stopping.cancelled().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!(
                "Connections still open after {} seconds, closing",
                shutdown_timeout.as_secs()
            );
        }
    }

    if orchestrator.shutdown(shutdown_timeout).await {
        info!("Agent shut down gracefully");
    } else {
        warn!("Agent shut down with uploads still unwinding");
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
