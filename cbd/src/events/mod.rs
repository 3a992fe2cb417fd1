//! Event Bus Architecture
//!
//! This module provides the event system for visibility into the callback
//! lifecycle. Every significant action emits an event. All consumers (audit
//! sink, metrics, log tailers) subscribe to the bus.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EVENT BUS                              │
//! │            (tokio::sync::broadcast channel)                  │
//! └─────────────────────────────────────────────────────────────┘
//!         ↑               ↑               ↑               ↑
//!    Admission        StateManager     Verification    Dispatch
//!    emits:           emits:           emits:          emits:
//!    - GateRejected   - StatusChanged  - CodeIssued    - DispatchAttempted
//!    - Honeypot...    - RetryScheduled - CodeVerified  - OutcomeReceived
//!
//!         ↓                     ↓                     ↓
//! ┌───────────────┐     ┌───────────────┐     ┌───────────────┐
//! │  Audit Sink   │     │    Metrics    │     │  Supervisor   │
//! │  (store)      │     │  (counters)   │     │  (health)     │
//! └───────────────┘     └───────────────┘     └───────────────┘
//! ```
//!
//! # Event Types
//!
//! See [`CbEvent`] for the complete list:
//! - Admission: `RequestSubmitted`, `GateRejected`, `HoneypotTripped`, `DuplicateCancelled`
//! - Lifecycle: `StatusChanged`, `DispatchAttempted`, `OutcomeReceived`
//! - Verification: `CodeIssued`, `CodeVerified`, `CodeRejected`
//! - Retry/escalation: `RetryScheduled`, `DeadLettered`, `EscalationAdvanced`
//! - Delivery/health: `NotificationSent`, `WorkerRestarted`

mod audit;
mod bus;
mod types;

pub use audit::{AuditSink, spawn_audit_sink};
pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, create_event_bus};
pub use types::{AuditRecord, CbEvent};
