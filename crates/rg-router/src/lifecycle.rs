//! Background retry of failed (and optionally unroutable) messages
//!
//! The engine never retries on its own; this scheduler calls the engine's
//! bulk retry operations on a fixed interval until shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::RoutingEngine;

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    /// Delay before the first run
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Also retry UNROUTABLE messages on each run
    pub retry_unroutable: bool,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            interval: Duration::from_secs(60),
            retry_unroutable: false,
        }
    }
}

pub struct RetryScheduler {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl RetryScheduler {
    pub fn start(engine: Arc<RoutingEngine>, config: RetrySchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        info!(
            initial_delay = ?config.initial_delay,
            interval = ?config.interval,
            retry_unroutable = config.retry_unroutable,
            "Starting retry scheduler"
        );

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + config.initial_delay;
            // interval_at panics on a zero period
            let period = config.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(start, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Running scheduled retry");
                        if let Err(e) = engine.retry_failed_messages().await {
                            error!(error = %e, "Retrying failed messages failed");
                        }
                        if config.retry_unroutable {
                            if let Err(e) = engine.retry_unroutable_messages().await {
                                error!(error = %e, "Retrying unroutable messages failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Retry scheduler shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, handle }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}
