//! Callbackd - Callback Request Lifecycle Orchestrator
//!
//! Callbackd takes a visitor's request to be called back and drives it
//! to a terminal outcome: verification, outbound dispatch through a
//! pluggable telephony provider, bounded retries, and escalation down a
//! fallback chain. The store is the only shared mutable resource; every
//! status change is a guarded compare-and-transition through the
//! [`state::StateManager`] actor.
//!
//! # Core Concepts
//!
//! - **Guarded transitions**: every writer re-validates the persisted
//!   status before applying its edge, so concurrent sweeps and callbacks
//!   degrade to no-ops instead of corrupting state
//! - **Wall-clock timeouts**: retries, escalation, and stale reaping
//!   compare stored timestamps, so they survive process restarts
//! - **Supervised sweeps**: the retry and escalation loops heartbeat and
//!   are restarted with backoff when they fault
//! - **Events everywhere**: every state-affecting action lands on the
//!   bus and in the audit trail
//!
//! # Modules
//!
//! - [`admission`] - submission gate chain and dispatch-time concurrency caps
//! - [`verify`] - one-time code issuance and checking
//! - [`lifecycle`] - the state machine engine and outcome classifier
//! - [`scheduler`] - the retry and escalation sweep workers
//! - [`provider`] - the telephony seam and its two backends
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod admission;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod events;
pub mod ipc;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod provider;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod verify;

// Re-export commonly used types
pub use admission::{AdmissionController, AdmissionError, ConcurrencyGate, Submission, TokenVerifier};
pub use config::{CommitMode, Config, OverflowPolicy};
pub use domain::{CallStatus, CallbackRequest, Priority, VerificationCode};
pub use events::{CbEvent, EventBus, create_event_bus};
pub use lifecycle::{Engine, EngineError};
pub use metrics::Metrics;
pub use notify::Notifier;
pub use provider::{Provider, ProviderError, create_provider};
pub use state::{StateError, StateManager};
pub use verify::Verifier;
