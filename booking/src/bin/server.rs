//! Seatline booking server.
//!
//! Runs the HTTP API together with the outbox relay, the hold sweeper, the
//! catalog and live-update consumers and startup saga recovery.
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin seatline-server
//! ```

use seatline_booking::{Config, SeatlineApp};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seatline_booking=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Seatline booking server");

    let config = Config::from_env();
    tracing::info!(
        redpanda = %config.redpanda.brokers,
        entitlements = config.entitlement.enabled,
        auto_resume = config.saga.auto_resume,
        "Configuration loaded"
    );

    let app = SeatlineApp::new(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = app.start(&shutdown_rx)?;
    tracing::info!(tasks = tasks.len(), "Background tasks started");

    let addr = app.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Listening");

    axum::serve(
        listener,
        app.router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Shut down gracefully");
    Ok(())
}
