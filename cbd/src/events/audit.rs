//! Audit sink - persists events to the store
//!
//! The AuditSink subscribes to the EventBus and writes every event to the
//! audit_events collection, giving each request a queryable history of what
//! happened to it and when.

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::state::StateManager;

use super::bus::EventBus;
use super::types::{AuditRecord, CbEvent};

/// Persists bus events as audit records via the StateManager
pub struct AuditSink {
    state: StateManager,
}

impl AuditSink {
    pub fn new(state: StateManager) -> Self {
        debug!("AuditSink::new: creating sink");
        Self { state }
    }

    /// Consume events from the receiver until the bus closes
    ///
    /// Persistence goes through RecordAudit, which does not emit, so the
    /// sink never feeds itself.
    pub async fn run(self, mut rx: broadcast::Receiver<CbEvent>) {
        debug!("AuditSink::run: starting audit sink");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let kind = event.kind();
                    if let Err(e) = self.state.record_audit(AuditRecord::new(event)).await {
                        error!(kind, error = %e, "AuditSink: failed to persist event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "AuditSink: lagged behind, missed events");
                    // Continue processing - we'll catch up
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("AuditSink: channel closed, shutting down");
                    break;
                }
            }
        }
    }
}

/// Spawn the audit sink as a background task
///
/// Subscribes before spawning so the task holds only a receiver; once every
/// bus handle is dropped the sink drains what is buffered and exits.
pub fn spawn_audit_sink(bus: &EventBus, state: StateManager) -> tokio::task::JoinHandle<()> {
    let rx = bus.subscribe();
    let sink = AuditSink::new(state);
    tokio::spawn(async move {
        sink.run(rx).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CallStatus;
    use crate::events::create_event_bus;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_audit_sink_persists_and_exits() {
        let temp = tempdir().unwrap();
        let bus = create_event_bus();
        let manager = StateManager::spawn(temp.path().join("store.db"), bus.clone()).unwrap();
        let handle = spawn_audit_sink(&bus, manager.clone());

        bus.emit(CbEvent::StatusChanged {
            request_id: "req-1".to_string(),
            from: CallStatus::Pending,
            to: CallStatus::Verified,
            message: "Contact verified".to_string(),
        });
        bus.emit(CbEvent::CodeIssued {
            request_id: "req-1".to_string(),
            channel: "sms".to_string(),
        });

        // Wait for the sink to drain both events
        let mut trail = Vec::new();
        for _ in 0..100 {
            trail = manager.list_audit("req-1").await.unwrap();
            if trail.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event.kind(), "StatusChanged");
        assert_eq!(trail[1].event.kind(), "CodeIssued");

        // Dropping every bus handle closes the channel and the sink exits
        drop(bus);
        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_without_request_id_still_persist() {
        let temp = tempdir().unwrap();
        let store_path = temp.path().join("store.db");
        let bus = create_event_bus();
        let manager = StateManager::spawn(&store_path, bus.clone()).unwrap();
        let handle = spawn_audit_sink(&bus, manager.clone());

        bus.emit(CbEvent::WorkerRestarted {
            worker: "retry-scheduler".to_string(),
            consecutive_failures: 2,
        });
        // The sink processes in order, so once the marker lands the
        // WorkerRestarted event has been persisted too
        bus.emit(CbEvent::CodeIssued {
            request_id: "marker".to_string(),
            channel: "sms".to_string(),
        });
        let mut marker = Vec::new();
        for _ in 0..100 {
            marker = manager.list_audit("marker").await.unwrap();
            if !marker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(marker.len(), 1);

        drop(bus);
        manager.shutdown().await.unwrap();
        handle.await.unwrap();

        // Not tied to a request, so it is invisible to the per-request
        // trail but still present in the collection
        let store = crate::domain::Store::open_read_only(&store_path).unwrap();
        assert_eq!(store.list_ids("audit_events").unwrap().len(), 2);
    }
}
