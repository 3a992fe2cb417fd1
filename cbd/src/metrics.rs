//! Daemon counters and liveness gauges
//!
//! Tracks aggregate activity across the daemon:
//! - Admission decisions (admitted, honeypot, per-gate rejections)
//! - Dispatch attempts and call outcomes
//! - Verification traffic and the commit ledger
//! - Worker heartbeats, failures and restarts
//!
//! Counters are fed two ways: the `MetricsSink` task subscribes to the
//! event bus and translates events into increments, while workers report
//! heartbeats and the verification module reports commits directly.
//! `snapshot_json` powers `cbd metrics` and the shutdown summary line.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use callstore::now_ms;

use crate::domain::CallStatus;
use crate::events::{CbEvent, EventBus};

/// Aggregate metrics for the daemon
#[derive(Debug, Default)]
pub struct Metrics {
    /// Global counters
    global: Counters,

    /// Rejection counts by gate name
    gate_rejections: RwLock<HashMap<String, u64>>,

    /// Call outcome counts by reported kind
    outcomes: RwLock<HashMap<String, u64>>,

    /// Commit ledger, keyed "mode/operation"
    commits: RwLock<HashMap<String, u64>>,

    /// Per-worker liveness and fault stats
    workers: RwLock<HashMap<String, WorkerStats>>,
}

/// Global metrics counters (thread-safe)
#[derive(Debug, Default)]
struct Counters {
    submissions_admitted: AtomicU64,
    submissions_honeypot: AtomicU64,
    submissions_rejected: AtomicU64,
    dispatches_placed: AtomicU64,
    dispatches_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    dead_lettered: AtomicU64,
    escalations: AtomicU64,
    codes_issued: AtomicU64,
    codes_verified: AtomicU64,
    codes_rejected: AtomicU64,
    notifications_sent: AtomicU64,
}

/// Per-worker supervision statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Worker name
    pub worker: String,
    /// Heartbeats reported
    pub beats: u64,
    /// Sweep failures reported
    pub failures: u64,
    /// Times the supervisor restarted this worker
    pub restarts: u64,
    /// Last heartbeat (Unix ms, 0 if never)
    pub last_beat_ms: i64,
}

/// Flat counter summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub submissions_admitted: u64,
    pub submissions_honeypot: u64,
    pub submissions_rejected: u64,
    pub dispatches_placed: u64,
    pub dispatches_failed: u64,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    pub escalations: u64,
    pub codes_issued: u64,
    pub codes_verified: u64,
    pub codes_rejected: u64,
    pub notifications_sent: u64,
    pub workers: usize,
}

impl Metrics {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        debug!("Metrics::new: called");
        Self::default()
    }

    /// Count a submission that passed every gate
    pub fn record_admitted(&self) {
        self.global.submissions_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a honeypot trip
    pub fn record_honeypot(&self) {
        self.global.submissions_honeypot.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a submission rejected by a named gate
    pub fn record_gate_rejection(&self, gate: &str) {
        debug!(%gate, "Metrics::record_gate_rejection: called");
        self.global.submissions_rejected.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut gates) = self.gate_rejections.write() {
            *gates.entry(gate.to_string()).or_default() += 1;
        } else {
            debug!(%gate, "record_gate_rejection: failed to acquire write lock");
        }
    }

    /// Count a call handed to the provider
    pub fn record_dispatch_placed(&self) {
        self.global.dispatches_placed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dispatch that ended in failure
    pub fn record_dispatch_failed(&self) {
        self.global.dispatches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a provider-reported call outcome by kind
    pub fn record_outcome(&self, kind: &str) {
        debug!(%kind, "Metrics::record_outcome: called");
        if let Ok(mut outcomes) = self.outcomes.write() {
            *outcomes.entry(kind.to_string()).or_default() += 1;
        } else {
            debug!(%kind, "record_outcome: failed to acquire write lock");
        }
    }

    /// Count a retry booking
    pub fn record_retry_scheduled(&self) {
        self.global.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that ran out of retries
    pub fn record_dead_letter(&self) {
        self.global.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an escalation step
    pub fn record_escalation(&self) {
        self.global.escalations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an issued verification code
    pub fn record_code_issued(&self) {
        self.global.codes_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an accepted verification code
    pub fn record_code_verified(&self) {
        self.global.codes_verified.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejected verification check
    pub fn record_code_rejected(&self) {
        self.global.codes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a best-effort notification
    pub fn record_notification(&self) {
        self.global.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a verification write in the commit ledger
    pub fn record_commit(&self, mode: &str, operation: &str) {
        debug!(%mode, %operation, "Metrics::record_commit: called");
        if let Ok(mut commits) = self.commits.write() {
            *commits.entry(format!("{mode}/{operation}")).or_default() += 1;
        } else {
            debug!(%mode, "record_commit: failed to acquire write lock");
        }
    }

    /// Record a worker heartbeat
    pub fn record_beat(&self, worker: &str) {
        if let Ok(mut workers) = self.workers.write() {
            let stats = entry_for(&mut workers, worker);
            stats.beats += 1;
            stats.last_beat_ms = now_ms();
        } else {
            debug!(%worker, "record_beat: failed to acquire write lock");
        }
    }

    /// Record a worker sweep failure
    pub fn record_worker_failure(&self, worker: &str) {
        debug!(%worker, "Metrics::record_worker_failure: called");
        if let Ok(mut workers) = self.workers.write() {
            entry_for(&mut workers, worker).failures += 1;
        } else {
            debug!(%worker, "record_worker_failure: failed to acquire write lock");
        }
    }

    /// Record a supervisor restart of a worker
    pub fn record_worker_restart(&self, worker: &str) {
        debug!(%worker, "Metrics::record_worker_restart: called");
        if let Ok(mut workers) = self.workers.write() {
            entry_for(&mut workers, worker).restarts += 1;
        } else {
            debug!(%worker, "record_worker_restart: failed to acquire write lock");
        }
    }

    /// Last heartbeat for a worker (Unix ms)
    pub fn last_beat_ms(&self, worker: &str) -> Option<i64> {
        self.workers.read().ok()?.get(worker).map(|s| s.last_beat_ms)
    }

    /// Stats for a specific worker
    pub fn worker_stats(&self, worker: &str) -> Option<WorkerStats> {
        debug!(%worker, "Metrics::worker_stats: called");
        self.workers.read().ok()?.get(worker).cloned()
    }

    /// Stats for every worker seen so far, sorted by name
    pub fn workers(&self) -> Vec<WorkerStats> {
        let mut workers: Vec<WorkerStats> = self
            .workers
            .read()
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default();
        workers.sort_by(|a, b| a.worker.cmp(&b.worker));
        workers
    }

    /// Get flat counter summary
    pub fn summary(&self) -> MetricsSummary {
        debug!("Metrics::summary: called");
        MetricsSummary {
            submissions_admitted: self.global.submissions_admitted.load(Ordering::Relaxed),
            submissions_honeypot: self.global.submissions_honeypot.load(Ordering::Relaxed),
            submissions_rejected: self.global.submissions_rejected.load(Ordering::Relaxed),
            dispatches_placed: self.global.dispatches_placed.load(Ordering::Relaxed),
            dispatches_failed: self.global.dispatches_failed.load(Ordering::Relaxed),
            retries_scheduled: self.global.retries_scheduled.load(Ordering::Relaxed),
            dead_lettered: self.global.dead_lettered.load(Ordering::Relaxed),
            escalations: self.global.escalations.load(Ordering::Relaxed),
            codes_issued: self.global.codes_issued.load(Ordering::Relaxed),
            codes_verified: self.global.codes_verified.load(Ordering::Relaxed),
            codes_rejected: self.global.codes_rejected.load(Ordering::Relaxed),
            notifications_sent: self.global.notifications_sent.load(Ordering::Relaxed),
            workers: self.workers.read().map(|w| w.len()).unwrap_or(0),
        }
    }

    /// Export all metrics as JSON
    pub fn snapshot_json(&self) -> serde_json::Value {
        debug!("Metrics::snapshot_json: called");
        let summary = self.summary();
        let gates: HashMap<String, u64> = self
            .gate_rejections
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();
        let outcomes: HashMap<String, u64> = self.outcomes.read().map(|o| o.clone()).unwrap_or_default();
        let commits: HashMap<String, u64> = self.commits.read().map(|c| c.clone()).unwrap_or_default();
        let workers = self.workers();

        serde_json::json!({
            "submissions": {
                "admitted": summary.submissions_admitted,
                "honeypot": summary.submissions_honeypot,
                "rejected": summary.submissions_rejected,
                "rejected_by_gate": gates,
            },
            "dispatches": {
                "placed": summary.dispatches_placed,
                "failed": summary.dispatches_failed,
            },
            "outcomes": outcomes,
            "retries": {
                "scheduled": summary.retries_scheduled,
                "dead_lettered": summary.dead_lettered,
            },
            "escalations": summary.escalations,
            "verification": {
                "issued": summary.codes_issued,
                "verified": summary.codes_verified,
                "rejected": summary.codes_rejected,
            },
            "commits": commits,
            "notifications": summary.notifications_sent,
            "workers": workers,
        })
    }
}

/// Get or create the stats slot for a worker
fn entry_for<'a>(workers: &'a mut HashMap<String, WorkerStats>, worker: &str) -> &'a mut WorkerStats {
    workers.entry(worker.to_string()).or_insert_with(|| WorkerStats {
        worker: worker.to_string(),
        ..Default::default()
    })
}

/// Bus consumer that turns events into counter increments
pub struct MetricsSink {
    metrics: Arc<Metrics>,
}

impl MetricsSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// Consume events until the bus closes
    pub async fn run(self, mut rx: broadcast::Receiver<CbEvent>) {
        debug!("MetricsSink::run: starting");
        loop {
            match rx.recv().await {
                Ok(event) => self.apply(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Metrics sink lagged; counters undercount");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("MetricsSink::run: bus closed, exiting");
                    break;
                }
            }
        }
    }

    fn apply(&self, event: &CbEvent) {
        match event {
            CbEvent::RequestSubmitted { .. } => self.metrics.record_admitted(),
            CbEvent::GateRejected { gate, .. } => self.metrics.record_gate_rejection(gate),
            CbEvent::HoneypotTripped { .. } => self.metrics.record_honeypot(),
            CbEvent::DuplicateCancelled { .. } => {}
            CbEvent::StatusChanged { to, .. } => {
                if *to == CallStatus::Failed {
                    self.metrics.record_dispatch_failed();
                }
            }
            CbEvent::DispatchAttempted { .. } => self.metrics.record_dispatch_placed(),
            CbEvent::OutcomeReceived { outcome, .. } => self.metrics.record_outcome(outcome),
            CbEvent::CodeIssued { .. } => self.metrics.record_code_issued(),
            CbEvent::CodeVerified { .. } => self.metrics.record_code_verified(),
            CbEvent::CodeRejected { .. } => self.metrics.record_code_rejected(),
            CbEvent::RetryScheduled { .. } => self.metrics.record_retry_scheduled(),
            CbEvent::DeadLettered { .. } => self.metrics.record_dead_letter(),
            CbEvent::EscalationAdvanced { .. } => self.metrics.record_escalation(),
            CbEvent::NotificationSent { .. } => self.metrics.record_notification(),
            CbEvent::WorkerRestarted { worker, .. } => self.metrics.record_worker_restart(worker),
        }
    }
}

/// Subscribe a metrics sink to the bus and run it in the background
pub fn spawn_metrics_sink(bus: &EventBus, metrics: Arc<Metrics>) -> tokio::task::JoinHandle<()> {
    let rx = bus.subscribe();
    let sink = MetricsSink::new(metrics);
    tokio::spawn(sink.run(rx))
}
