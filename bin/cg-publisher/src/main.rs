//! ConfirmGuard Publisher
//!
//! Reads newline-delimited JSON publish requests from stdin and publishes
//! them to RabbitMQ with mandatory routing and publisher confirms. Returns
//! and confirms are reconciled so that every message that did not reach a
//! queue stays in its bucket for the resend job.
//!
//! Request format (one per line):
//!
//! ```json
//! {"routing_key": "order.save", "payload": {"order": 1}, "bucket": "orders", "tracked": true}
//! ```
//!
//! `bucket` defaults to the routing key, `tracked` defaults to `true` and
//! `id` defaults to a fresh UUID.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CG_CONFIG` | `confirmguard.toml` | Configuration file path |
//! | `RUST_LOG` | `info` | Log level |
//!
//! Settings from the file can be overridden with the `CG_*` variables
//! documented in `cg-config`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cg_amqp::AmqpTransport;
use cg_cache::CorrelationCache;
use cg_common::{CachedMessage, CorrelationKey};
use cg_config::ConfirmGuardConfig;
use cg_reconciler::{AckReconciler, ReliablePublisher, StagingSweeper, SweeperConfig};

#[derive(Debug, Deserialize)]
struct PublishRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    routing_key: String,
    payload: serde_json::Value,
    #[serde(default = "default_tracked")]
    tracked: bool,
}

fn default_tracked() -> bool {
    true
}

impl PublishRequest {
    fn into_message(self, exchange: &str) -> Result<(CachedMessage, Option<CorrelationKey>)> {
        let bucket = self.bucket.unwrap_or_else(|| self.routing_key.clone());
        let key = match self.id {
            Some(id) => CorrelationKey::new(bucket, id),
            None => CorrelationKey::generate(bucket),
        };
        let message = CachedMessage::json(key.id.clone(), exchange, self.routing_key, &self.payload)?;
        Ok((message, self.tracked.then_some(key)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting ConfirmGuard Publisher");

    let config_path = PathBuf::from(
        std::env::var("CG_CONFIG").unwrap_or_else(|_| "confirmguard.toml".to_string()),
    );
    let config = ConfirmGuardConfig::load(Some(config_path.as_path()))?;

    // Metrics
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    info!("Metrics exporter listening on http://{}/metrics", metrics_addr);

    // Broker
    let transport = Arc::new(AmqpTransport::connect(&config.amqp.uri).await?);
    info!(exchange = %config.amqp.exchange, "AMQP transport ready");

    let cache = Arc::new(CorrelationCache::new());
    let reconciler = Arc::new(AckReconciler::new(cache.clone()));
    let publisher = Arc::new(ReliablePublisher::new(transport, reconciler.clone()));

    let sweeper = config.staging.ttl().map(|staging_ttl| {
        StagingSweeper::start(
            reconciler.clone(),
            SweeperConfig {
                staging_ttl,
                interval: config.staging.sweep_interval(),
            },
        )
    });
    if sweeper.is_none() {
        warn!("Staging sweep disabled, returned messages without an ack stay staged");
    }

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Reading publish requests from stdin, Ctrl+C to stop");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("End of input");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request: PublishRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Skipping malformed request: {}", e);
                        continue;
                    }
                };
                let (message, context) = match request.into_message(&config.amqp.exchange) {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!("Skipping request: {}", e);
                        continue;
                    }
                };

                let publisher = publisher.clone();
                in_flight.spawn(async move {
                    let message_id = message.id.clone();
                    match publisher.publish(message, context).await {
                        Ok(outcome) => info!(message_id = %message_id, outcome = outcome.as_str(), "Publish reconciled"),
                        Err(e) => error!(message_id = %message_id, "Publish failed: {}", e),
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received...");
                break;
            }
        }
    }

    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = in_flight.len(), "Timed out waiting for confirmations");
    }

    if let Some(sweeper) = &sweeper {
        sweeper.shutdown();
    }

    for bucket in cache.bucket_names() {
        let backlog = cache.bucket_len(&bucket);
        if backlog > 0 {
            warn!(bucket = %bucket, backlog, "Messages awaiting resend");
        }
    }
    info!(
        pending = cache.pending_total(),
        staged = cache.staging_len(),
        "ConfirmGuard Publisher shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: PublishRequest =
            serde_json::from_str(r#"{"routing_key": "order.save", "payload": {"order": 1}}"#).unwrap();
        let (message, context) = request.into_message("business").unwrap();

        let key = context.unwrap();
        assert_eq!(key.bucket, "order.save");
        assert_eq!(key.id, message.id);
        assert_eq!(message.exchange, "business");
    }

    #[test]
    fn test_untracked_request() {
        let request: PublishRequest = serde_json::from_str(
            r#"{"id": "m1", "bucket": "orders", "routing_key": "order.save", "payload": {}, "tracked": false}"#,
        )
        .unwrap();
        let (message, context) = request.into_message("business").unwrap();

        assert_eq!(message.id, "m1");
        assert!(context.is_none());
    }
}
