//! # parlor-server
//!
//! Single-room chat relay. Every envelope a client sends over its WebSocket
//! is broadcast to every connected client, sender included.
//!
//! This binary provides:
//! - **`/ws`** WebSocket endpoint, one hub-registered connection per client
//! - **Hub** task that owns membership and fans messages out without ever
//!   waiting on a slow receiver
//! - **`/health`** and **`/stats`** read-only endpoints
//! - the static chat client page at `/`

mod api;
mod config;
mod connection;
mod error;
mod hub;

use std::sync::Arc;

use parlor_shared::constants::{APP_NAME, HUB_QUEUE_CAPACITY};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parlor_server=debug")),
        )
        .init();

    info!("Starting {} relay v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Start the hub (runs until every handle is dropped)
    // -----------------------------------------------------------------------
    let hub = Hub::spawn(config.outbound_queue_capacity, HUB_QUEUE_CAPACITY);

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub,
        config: Arc::new(config),
    };

    info!(
        websocket = %format!("ws://{http_addr}/ws"),
        health = %format!("http://{http_addr}/health"),
        stats = %format!("http://{http_addr}/stats"),
        "Endpoints"
    );

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
