//! Escalation sweeper
//!
//! Walks calls that have been ringing past the escalation timeout and
//! re-dispatches them down the configured target chain. Spawned only
//! when escalation is enabled and a chain is configured.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::lifecycle::Engine;
use crate::metrics::Metrics;

/// Worker name used for heartbeats and supervision
pub const ESCALATION_WORKER: &str = "escalation-sweep";

/// Run the escalation sweep loop until shutdown or a sweep error
pub async fn run_escalation_sweeper(
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    debug!(?interval, "run_escalation_sweeper: starting");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics.record_beat(ESCALATION_WORKER);
                let advanced = engine.escalation_sweep().await?;
                if advanced > 0 {
                    info!(advanced, "Escalation sweep advanced calls");
                }
            }
            _ = shutdown.recv() => {
                info!("Escalation sweeper stopping");
                return Ok(());
            }
        }
    }
}
