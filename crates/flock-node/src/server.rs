//! Server lifecycle: bind, serve, drain on shutdown.

use anyhow::Context;
use axum::Router;
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::{create_router, AppState};
use crate::config::Config;

/// Binds the configured address and serves until SIGINT or SIGTERM.
pub async fn serve(config: &Config) -> anyhow::Result<()> {
    let state = AppState::new(config);
    let app = create_router(state, config.coalesce.policy(), &config.server);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        read_timeout_ms = config.server.read_timeout_ms,
        write_timeout_ms = config.server.write_timeout_ms,
        "Listening"
    );

    run(listener, app, config.server.shutdown_grace(), shutdown_signal()).await
}

/// Serves `app` on `listener` until `signal` resolves.
///
/// After the signal, in-flight connections get `grace` to finish before the
/// server is aborted.
pub async fn run<F>(
    listener: TcpListener,
    app: Router,
    grace: Duration,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = drain_rx.await;
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => {
            joined.context("server task failed")?.context("server error")?;
            return Ok(());
        }
        _ = signal => {}
    }

    tracing::info!("Shutting down server");
    let _ = drain_tx.send(());

    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => joined.context("server task failed")?.context("server error")?,
        Err(_) => {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Graceful shutdown timed out, dropping open connections"
            );
            server.abort();
        }
    }

    tracing::info!("Server exiting");
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
