//! Retry sweeper
//!
//! A periodic worker that dispatches booked retries once they come due.
//! The loop heartbeats before each pass so the supervisor can tell a
//! slow sweep from a dead one; errors propagate out and the supervisor
//! restarts the worker.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::lifecycle::Engine;
use crate::metrics::Metrics;

/// Worker name used for heartbeats and supervision
pub const RETRY_WORKER: &str = "retry-sweep";

/// Delay before attempt `n` is retried, in seconds
///
/// Exponential: 60s, 5m, then capped at 15m for every later attempt.
pub fn backoff(attempt: u32) -> u32 {
    let exponent = attempt.saturating_sub(1);
    60u32.saturating_mul(5u32.saturating_pow(exponent)).min(900)
}

/// Run the retry sweep loop until shutdown or a sweep error
///
/// tokio intervals tick immediately, so the first sweep runs right at
/// startup rather than one interval later.
pub async fn run_retry_sweeper(
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    debug!(?interval, "run_retry_sweeper: starting");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics.record_beat(RETRY_WORKER);
                let placed = engine.retry_sweep().await?;
                if placed > 0 {
                    info!(placed, "Retry sweep placed calls");
                }
            }
            _ = shutdown.recv() => {
                info!("Retry sweeper stopping");
                return Ok(());
            }
        }
    }
}
