use std::future::IntoFuture;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::endpoints;
use crate::service::CoreService;

/// How long in-flight requests get to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Starts the service, the background workers and the HTTP server, and
/// runs until a shutdown signal arrives.
pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("corestash")
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let (service, workers) =
            CoreService::create(config.clone()).context("creating service")?;

        let listener = tokio::net::TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("binding {}", config.bind))?;
        tracing::info!("starting HTTP server on {}", listener.local_addr()?);

        let shutdown = CancellationToken::new();
        spawn_signal_handler(shutdown.clone());

        let app = endpoints::create_app(service.clone());
        let graceful = shutdown.clone();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .into_future();

        tokio::select! {
            result = server => result.context("serving")?,
            _ = async { shutdown.cancelled().await; tokio::time::sleep(SHUTDOWN_GRACE).await } => {
                tracing::warn!("shutdown grace period expired, dropping remaining connections");
            }
        }

        // Dropping the service (and the router that held clones of it)
        // closes the queue senders; the workers drain and exit.
        drop(service);
        workers.shutdown().await;
        tracing::info!("system shutdown complete");

        Ok(())
    })
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
