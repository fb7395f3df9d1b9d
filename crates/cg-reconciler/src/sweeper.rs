//! Staging sweeper - releases returned messages whose ack never arrived
//!
//! A channel that closes between a return and its confirm leaves the message
//! in staging forever. The sweeper moves such entries back to their bucket
//! so the resend job sees them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::reconciler::AckReconciler;

/// Configuration for the staging sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Age after which a staged message is released
    pub staging_ttl: Duration,
    /// How often to look for stale entries
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            staging_ttl: Duration::from_secs(300),
            interval: Duration::from_secs(30),
        }
    }
}

pub struct StagingSweeper {
    shutdown_tx: broadcast::Sender<()>,
}

impl StagingSweeper {
    /// Spawn the sweep loop
    pub fn start(reconciler: Arc<AckReconciler>, config: SweeperConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let released = reconciler.sweep_staging(config.staging_ttl);
                        if released.is_empty() {
                            debug!("Staging sweep found nothing to release");
                        } else {
                            info!(released = released.len(), "Staging sweep released messages for resend");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Staging sweeper shutting down");
                        break;
                    }
                }
            }
        });

        info!(
            ttl_secs = config.staging_ttl.as_secs(),
            interval_secs = config.interval.as_secs(),
            "Staging sweeper started"
        );

        Self { shutdown_tx }
    }

    /// Signal the sweep loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
