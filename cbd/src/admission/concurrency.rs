//! Concurrency admission at dispatch time
//!
//! Submission gates decide whether a request may exist; this gate
//! decides whether a call may be placed right now. Live Calling rows
//! are checked against the call ceiling and recently-verified requests
//! against the message ceiling. The overflow policy decides what a
//! breach means: `reject` denies the dispatch, `queue` and `delay`
//! log and proceed (soft cap). Counting errors fail open.

use std::sync::Arc;

use tracing::{debug, warn};

use callstore::now_ms;

use crate::config::{CallsConfig, OverflowPolicy};
use crate::domain::CallStatus;
use crate::events::{CbEvent, EventBus};
use crate::state::StateManager;

/// Rolling window for the recently-verified count
const VERIFIED_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Verdict for a single dispatch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ConcurrencyDecision {
    /// Under the ceilings, or a soft-cap policy let it through
    Proceed,
    /// Over a ceiling with the `reject` policy
    Deny { reason: String },
}

/// Gate comparing live activity against the configured ceilings
pub struct ConcurrencyGate {
    state: StateManager,
    bus: Arc<EventBus>,
    max_calls: u64,
    max_messages: u64,
    overflow: OverflowPolicy,
}

impl ConcurrencyGate {
    pub fn new(state: StateManager, bus: Arc<EventBus>, config: &CallsConfig) -> Self {
        Self {
            state,
            bus,
            max_calls: config.max_concurrent_calls,
            max_messages: config.max_concurrent_messages,
            overflow: config.overflow,
        }
    }

    /// Decide whether one more call may be placed
    pub async fn admit_call(&self) -> ConcurrencyDecision {
        let Some(reason) = self.breach().await else {
            return ConcurrencyDecision::Proceed;
        };

        match self.overflow {
            OverflowPolicy::Reject => {
                debug!(%reason, "admit_call: denying dispatch");
                self.bus.emit(CbEvent::GateRejected {
                    gate: "concurrency".to_string(),
                    reason: reason.clone(),
                });
                ConcurrencyDecision::Deny { reason }
            }
            OverflowPolicy::Queue | OverflowPolicy::Delay => {
                warn!(%reason, policy = %self.overflow, "Concurrency ceiling breached; proceeding anyway");
                ConcurrencyDecision::Proceed
            }
        }
    }

    /// First breached ceiling, if any
    async fn breach(&self) -> Option<String> {
        match self.state.count_by_status(CallStatus::Calling).await {
            Ok(calling) if calling >= self.max_calls => {
                return Some(format!(
                    "Concurrent call limit reached ({calling}/{})",
                    self.max_calls
                ));
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "Calling count unavailable; allowing dispatch");
            }
        }

        let since = now_ms() - VERIFIED_WINDOW_MS;
        match self.state.count_verified_since(since).await {
            Ok(verified) if verified >= self.max_messages => {
                return Some(format!(
                    "Recently-verified limit reached ({verified}/{})",
                    self.max_messages
                ));
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "Verified count unavailable; allowing dispatch");
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CallbackRequest;
    use crate::events::create_event_bus;
    use tempfile::TempDir;

    async fn seeded_manager(calling: usize, verified: usize) -> (StateManager, Arc<EventBus>, TempDir) {
        let dir = TempDir::new().unwrap();
        let bus = create_event_bus();
        let manager = StateManager::spawn(dir.path().join("store.db"), Arc::clone(&bus)).unwrap();

        for i in 0..calling {
            let request = CallbackRequest::with_id(format!("req-calling-{i}"), "+13217047403");
            manager.create_request(request).await.unwrap();
            manager
                .transition(&format!("req-calling-{i}"), CallStatus::Verified, "Contact verified", None, None, None)
                .await
                .unwrap();
            manager
                .transition(&format!("req-calling-{i}"), CallStatus::Calling, "Calling", None, None, None)
                .await
                .unwrap();
        }
        for i in 0..verified {
            let request = CallbackRequest::with_id(format!("req-verified-{i}"), "+13217047403");
            manager.create_request(request).await.unwrap();
            manager
                .transition(&format!("req-verified-{i}"), CallStatus::Verified, "Contact verified", None, None, None)
                .await
                .unwrap();
        }

        (manager, bus, dir)
    }

    fn calls_config(max_calls: u64, max_messages: u64, overflow: OverflowPolicy) -> CallsConfig {
        CallsConfig {
            max_concurrent_calls: max_calls,
            max_concurrent_messages: max_messages,
            overflow,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_under_ceilings_proceeds() {
        let (manager, bus, _dir) = seeded_manager(1, 1).await;
        let gate = ConcurrencyGate::new(manager.clone(), Arc::clone(&bus), &calls_config(3, 10, OverflowPolicy::Reject));

        assert_eq!(gate.admit_call().await, ConcurrencyDecision::Proceed);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_ceiling_rejects_and_emits() {
        let (manager, bus, _dir) = seeded_manager(2, 0).await;
        let gate = ConcurrencyGate::new(manager.clone(), Arc::clone(&bus), &calls_config(2, 10, OverflowPolicy::Reject));
        let mut rx = bus.subscribe();

        match gate.admit_call().await {
            ConcurrencyDecision::Deny { reason } => {
                assert_eq!(reason, "Concurrent call limit reached (2/2)");
            }
            other => panic!("expected denial, got {other:?}"),
        }

        match rx.recv().await.unwrap() {
            CbEvent::GateRejected { gate, .. } => assert_eq!(gate, "concurrency"),
            other => panic!("unexpected event: {other:?}"),
        }
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_verified_ceiling_rejects() {
        let (manager, bus, _dir) = seeded_manager(0, 3).await;
        let gate = ConcurrencyGate::new(manager.clone(), Arc::clone(&bus), &calls_config(5, 3, OverflowPolicy::Reject));

        match gate.admit_call().await {
            ConcurrencyDecision::Deny { reason } => {
                assert_eq!(reason, "Recently-verified limit reached (3/3)");
            }
            other => panic!("expected denial, got {other:?}"),
        }
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_policy_is_a_soft_cap() {
        let (manager, bus, _dir) = seeded_manager(2, 0).await;
        let gate = ConcurrencyGate::new(manager.clone(), Arc::clone(&bus), &calls_config(1, 10, OverflowPolicy::Queue));

        assert_eq!(gate.admit_call().await, ConcurrencyDecision::Proceed);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delay_policy_behaves_like_queue() {
        let (manager, bus, _dir) = seeded_manager(2, 0).await;
        let gate = ConcurrencyGate::new(manager.clone(), Arc::clone(&bus), &calls_config(1, 10, OverflowPolicy::Delay));

        assert_eq!(gate.admit_call().await, ConcurrencyDecision::Proceed);
        manager.shutdown().await.unwrap();
    }
}
