//! ackbus-ping: liveness ping producer
//!
//! Sends a small status ping on a topic at a fixed interval through a
//! `LazySender`. Pings produced while the broker is unreachable are dropped;
//! the sender keeps reconnecting in the background.
//!
//! ## Configuration
//! - ACKBUS_CONFIG / ACKBUS__*: bus configuration (see `BusConfig::load`)
//! - ACKBUS_PING_TOPIC: topic to ping on (default: "health")
//! - ACKBUS_PING_SOURCE: source tag of the pings (default: host name or "ackbus-ping")
//! - ACKBUS_PING_INTERVAL_MS: ping interval (default: 5000)
//! - ACKBUS_LOG: log filter (default: info)

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use ackbus::bus::{BusError, Context, LazySender, SenderExt};
use ackbus::config::BusConfig;
use ackbus::utils::bootstrap::{connection_factory, init_tracing};

const DEFAULT_TOPIC: &str = "health";
const DEFAULT_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Serialize)]
struct Ping {
    seq: u64,
    sent_at: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = BusConfig::load(None)?;
    let topic = std::env::var("ACKBUS_PING_TOPIC").unwrap_or_else(|_| DEFAULT_TOPIC.to_string());
    let source = std::env::var("ACKBUS_PING_SOURCE")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "ackbus-ping".to_string());
    let interval = std::env::var("ACKBUS_PING_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_INTERVAL_MS));

    let factory = connection_factory(&config)?;
    let sender = LazySender::new(factory.clone(), "ackbus-ping");
    sender.start_connect();

    info!(
        topic = %topic,
        source = %source,
        interval_ms = %interval.as_millis(),
        transport = ?config.transport,
        "ackbus-ping started"
    );

    let ctx = Context::background();
    let mut ticker = tokio::time::interval(interval);
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                seq += 1;
                let ping = Ping { seq, sent_at: chrono::Utc::now() };
                match sender.send_json(&ctx, &topic, &source, &ping).await {
                    Ok(()) => debug!(seq, "Ping sent"),
                    Err(BusError::NotConnected) => debug!(seq, "Not connected, ping dropped"),
                    Err(e) => warn!(seq, error = %e, "Ping failed"),
                }
            }
        }
    }

    ctx.cancel();
    sender.close().await?;
    factory.close_default().await?;
    info!(sent = seq, "ackbus-ping stopped");
    Ok(())
}
