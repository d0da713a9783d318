#![doc = include_str!("../README.md")]

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use zipstream::ServerConfig;
use zipstream_server::server::config::CliArgs;
use zipstream_server::server::service::{app, AppState};
use zipstream_server::server::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_tracing();

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        "serving archives from {} on {}",
        config.base_dir.display(),
        listener.local_addr()?
    );

    let state = AppState::new(config);
    let shutdown = state.shutdown.clone();

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("service shut down successfully");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, then cancels the shared token so
/// in-flight archive streams kill their compressors before the listener
/// stops accepting.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("received SIGTERM signal");
        },
    }

    tracing::info!("shutdown signal received, terminating gracefully...");
    shutdown.cancel();
}
