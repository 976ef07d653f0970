mod bootstrap;
mod gateway;
mod health;
mod routes;
mod sse;
#[cfg(test)]
mod test_support;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use neura_core::clock::system_clock;
use neura_core::config::{GatewayConfig, LoadOptions};
use tokio::sync::Notify;

use crate::routes::AppState;

fn init_logging(config: &GatewayConfig) {
    use neura_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap emits its first event.
    let config = GatewayConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    let router = routes::router(AppState {
        gateway: app.gateway.clone(),
        streaming: app.streaming,
        clock: system_clock(),
    });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "neura gateway listening"
    );
    let signalled = Arc::new(Notify::new());
    let shutdown = {
        let signalled = signalled.clone();
        async move {
            wait_for_shutdown().await;
            signalled.notify_one();
        }
    };
    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown).into_future();
    tokio::pin!(server);

    // Once ctrl-c arrives, in-flight requests get the grace period to finish.
    tokio::select! {
        result = &mut server => result?,
        _ = async {
            signalled.notified().await;
            tokio::time::sleep(grace).await;
        } => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "in-flight requests did not finish before the grace period"
        ),
    }
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "neura gateway stopped"
    );

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "could not listen for ctrl-c"
        );
    }
}
