//! BitMEX Real-Time Depth Server
//!
//! Streams BitMEX order books and trades and republishes the values named in
//! `RTD_SUBSCRIPTIONS` as they change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rtd_core::{ConflatingSink, DataKey, SubscriberHandle};
use rtd_services::{MarketDataServer, ServerConfig};

/// Used when `RTD_SUBSCRIPTIONS` is unset
const DEFAULT_SUBSCRIPTIONS: &str = "XBTUSD:Bid:0,XBTUSD:Ask:0,XBTUSD:Last";

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rtd_server=debug")),
        )
        .init();

    info!("Starting BitMEX real-time depth server");

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let topics = parse_subscriptions(
        &std::env::var("RTD_SUBSCRIPTIONS").unwrap_or_else(|_| DEFAULT_SUBSCRIPTIONS.to_string()),
    );

    let sink = Arc::new(ConflatingSink::new());
    let server = Arc::new(
        MarketDataServer::start(config, sink.clone())
            .await
            .context("failed to start server")?,
    );

    let mut watched: HashMap<SubscriberHandle, DataKey> = HashMap::new();
    for topic in &topics {
        match server.connect_topic(topic) {
            Ok(conn) => {
                info!("{} -> {} = {:?}", conn.handle, conn.key, conn.value);
                watched.insert(conn.handle, conn.key);
            }
            Err(e) => warn!("Skipping subscription {:?}: {}", topic.join(":"), e),
        }
    }

    // Print pushed values, latest per handle
    let printer = tokio::spawn(async move {
        loop {
            for update in sink.changed().await {
                match watched.get(&update.handle) {
                    Some(key) => info!("{} = {}", key, update.value),
                    None => info!("{} = {}", update.handle, update.value),
                }
            }
        }
    });

    // Periodic health report
    let health_server = Arc::clone(&server);
    let health = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match serde_json::to_string(&health_server.health()) {
                Ok(json) => info!("Health: {}", json),
                Err(e) => warn!("Failed to serialize health: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    health.abort();
    server.shutdown().await;
    drop(server);
    printer.abort();

    info!("Server stopped");
    Ok(())
}

/// Parse `SYM:DataPoint[:level]` entries separated by commas
fn parse_subscriptions(raw: &str) -> Vec<Vec<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.split(':').map(|part| part.trim().to_string()).collect())
        .collect()
}
