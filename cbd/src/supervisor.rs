//! Worker supervision
//!
//! Keeps the sweep workers alive: a supervised worker that faults or
//! stops heartbeating is restarted with linear backoff, and every
//! restart is recorded and broadcast as a `WorkerRestarted` event.
//!
//! Heartbeats come through `Metrics::record_beat`; a worker that goes
//! silent past the staleness window is treated the same as one that
//! returned an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use callstore::now_ms;

use crate::events::{CbEvent, EventBus};
use crate::metrics::Metrics;

/// How a worker incarnation ended
enum RunEnd {
    Clean,
    Fault(String),
}

/// Delay before restart attempt `n`: one second per consecutive
/// failure, capped at a minute
fn restart_delay(consecutive_failures: u32) -> Duration {
    Duration::from_secs(u64::from(consecutive_failures.min(60)))
}

/// Run a worker under supervision until shutdown
///
/// The factory is invoked for each incarnation; workers receive their
/// own shutdown receivers and are expected to return `Ok(())` when one
/// fires. Returning an error, panicking, or going heartbeat-silent
/// longer than `staleness` counts as a fault and triggers a restart.
pub async fn supervise<F, Fut>(
    name: &'static str,
    staleness: Duration,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
    mut shutdown: broadcast::Receiver<()>,
    factory: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut consecutive_failures: u32 = 0;
    let watch_every = (staleness / 4).max(Duration::from_millis(250));

    loop {
        let started = now_ms();
        let mut handle = tokio::spawn(factory());
        let mut watchdog = tokio::time::interval(watch_every);
        // The first interval tick completes immediately; consume it
        watchdog.tick().await;

        let end = loop {
            tokio::select! {
                joined = &mut handle => {
                    break match joined {
                        Ok(Ok(())) => RunEnd::Clean,
                        Ok(Err(error)) => RunEnd::Fault(error.to_string()),
                        Err(join_error) => RunEnd::Fault(format!("worker panicked: {join_error}")),
                    };
                }
                _ = watchdog.tick() => {
                    // A fresh incarnation gets a full window before its
                    // first beat is expected
                    let reference = metrics.last_beat_ms(name).map_or(started, |beat| beat.max(started));
                    let silent_ms = now_ms() - reference;
                    if silent_ms > staleness.as_millis() as i64 {
                        handle.abort();
                        let _ = (&mut handle).await;
                        break RunEnd::Fault(format!("no heartbeat for {silent_ms}ms"));
                    }
                }
                _ = shutdown.recv() => {
                    // The worker holds its own shutdown receiver; give it
                    // a moment to wind down before forcing the issue
                    if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                        warn!(worker = name, "Worker ignored shutdown; aborting");
                        handle.abort();
                    }
                    info!(worker = name, "Supervisor stopping");
                    return;
                }
            }
        };

        match end {
            RunEnd::Clean => {
                info!(worker = name, "Worker exited cleanly");
                return;
            }
            RunEnd::Fault(reason) => {
                consecutive_failures += 1;
                metrics.record_worker_failure(name);
                error!(worker = name, %reason, consecutive_failures, "Worker faulted");

                let delay = restart_delay(consecutive_failures);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        info!(worker = name, "Supervisor stopping during restart backoff");
                        return;
                    }
                }

                // The metrics sink picks this up and counts the restart
                bus.emit(CbEvent::WorkerRestarted {
                    worker: name.to_string(),
                    consecutive_failures,
                });
                info!(worker = name, consecutive_failures, "Restarting worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_restart_delay_caps() {
        assert_eq!(restart_delay(1), Duration::from_secs(1));
        assert_eq!(restart_delay(3), Duration::from_secs(3));
        assert_eq!(restart_delay(60), Duration::from_secs(60));
        assert_eq!(restart_delay(100), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_supervise_clean_exit() {
        let metrics = Arc::new(Metrics::new());
        let bus = create_event_bus();
        let (shutdown_tx, _) = broadcast::channel(4);

        let handle = tokio::spawn(supervise(
            "oneshot",
            Duration::from_secs(60),
            Arc::clone(&metrics),
            bus,
            shutdown_tx.subscribe(),
            move || async move { Ok(()) },
        ));

        handle.await.unwrap();
        assert!(metrics.worker_stats("oneshot").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_restarts_after_faults() {
        let metrics = Arc::new(Metrics::new());
        let bus = create_event_bus();
        let mut events = bus.subscribe();
        let (shutdown_tx, _) = broadcast::channel(4);
        let attempts = Arc::new(AtomicU32::new(0));

        let factory_attempts = Arc::clone(&attempts);
        let factory_tx = shutdown_tx.clone();
        let handle = tokio::spawn(supervise(
            "flaky-sweep",
            Duration::from_secs(600),
            Arc::clone(&metrics),
            Arc::clone(&bus),
            shutdown_tx.subscribe(),
            move || {
                let attempts = Arc::clone(&factory_attempts);
                let mut shutdown = factory_tx.subscribe();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        eyre::bail!("sweep exploded");
                    }
                    let _ = shutdown.recv().await;
                    Ok(())
                }
            },
        ));

        // Two faulting incarnations, then a healthy one
        let mut restarts = Vec::new();
        for _ in 0..200 {
            while let Ok(event) = events.try_recv() {
                if let CbEvent::WorkerRestarted { consecutive_failures, .. } = event {
                    restarts.push(consecutive_failures);
                }
            }
            if restarts.len() >= 2 && attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(restarts, vec![1, 2]);
        assert_eq!(metrics.worker_stats("flaky-sweep").unwrap().failures, 2);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_supervise_detects_stalled_worker() {
        let metrics = Arc::new(Metrics::new());
        let bus = create_event_bus();
        let (shutdown_tx, _) = broadcast::channel(4);

        let handle = tokio::spawn(supervise(
            "stalled-sweep",
            Duration::from_millis(300),
            Arc::clone(&metrics),
            bus,
            shutdown_tx.subscribe(),
            move || async move {
                std::future::pending::<()>().await;
                Ok(())
            },
        ));

        let mut failures = 0;
        for _ in 0..100 {
            failures = metrics.worker_stats("stalled-sweep").map(|s| s.failures).unwrap_or(0);
            if failures >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(failures >= 1, "stalled worker never flagged");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
