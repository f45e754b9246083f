//! Unison Relay Server
//!
//! Accepts WebSocket connections from Unison clients, keeps session rooms,
//! and fans host playback/playlist events out to listeners.
//!
//! Usage:
//!   cargo run --release                    # listens on 0.0.0.0:4100
//!   cargo run --release -- 127.0.0.1:9000  # custom bind address

mod metrics;
mod rooms;
mod server;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Default bind address
const DEFAULT_ADDR: &str = "0.0.0.0:4100";

/// How often to log a metrics summary
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    // Periodic metrics summary
    let metrics_for_log = Arc::clone(&metrics);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            info!("Metrics: {}", metrics_for_log.read().summary());
        }
    });

    server::run(&addr, metrics).await
}
