//! State manager messages
//!
//! Commands and responses for the actor pattern.

use tokio::sync::oneshot;

use thiserror::Error;

use crate::domain::{CallStatus, CallbackRequest, Priority, VerificationCode};
use crate::events::AuditRecord;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: CallStatus,
        to: CallStatus,
    },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Request operations
    CreateRequest {
        request: CallbackRequest,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetRequest {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<CallbackRequest>>>,
    },
    ListRequests {
        status_filter: Option<CallStatus>,
        reply: oneshot::Sender<StateResponse<Vec<CallbackRequest>>>,
    },

    /// Guarded status transition: re-validates the current persisted
    /// status against the edge table (and `expect_from`, when given)
    /// before writing status + message + provider refs in one update.
    Transition {
        id: String,
        to: CallStatus,
        message: String,
        call_ref: Option<String>,
        message_ref: Option<String>,
        expect_from: Option<Vec<CallStatus>>,
        reply: oneshot::Sender<StateResponse<CallbackRequest>>,
    },

    /// Failed -> RetryScheduled with the attempt counted and the next
    /// attempt booked, in one write.
    ScheduleRetry {
        id: String,
        message: String,
        next_retry_at: i64,
        reply: oneshot::Sender<StateResponse<CallbackRequest>>,
    },

    /// Failed -> DeadLetter with the final attempt counted, in one write.
    DeadLetter {
        id: String,
        message: String,
        reply: oneshot::Sender<StateResponse<CallbackRequest>>,
    },

    /// Advance the escalation chain on a Calling request: level, anchor
    /// timestamp, target, and the new call ref change in one write.
    RecordEscalation {
        id: String,
        target: String,
        call_ref: Option<String>,
        message: String,
        reply: oneshot::Sender<StateResponse<CallbackRequest>>,
    },

    // Counting queries for admission gates and status output
    CountByStatus {
        status: CallStatus,
        reply: oneshot::Sender<StateResponse<u64>>,
    },
    CountCreatedSince {
        since_ms: i64,
        reply: oneshot::Sender<StateResponse<u64>>,
    },
    CountVerifiedSince {
        since_ms: i64,
        reply: oneshot::Sender<StateResponse<u64>>,
    },
    CountByFingerprintSince {
        fingerprint: String,
        since_ms: i64,
        reply: oneshot::Sender<StateResponse<u64>>,
    },
    StatusCounts {
        reply: oneshot::Sender<StateResponse<Vec<(CallStatus, u64)>>>,
    },
    PriorityCounts {
        reply: oneshot::Sender<StateResponse<Vec<(Priority, u64)>>>,
    },

    /// Non-terminal requests for a contact created within the window
    FindActiveByContact {
        phone: String,
        since_ms: i64,
        reply: oneshot::Sender<StateResponse<Vec<CallbackRequest>>>,
    },

    /// Due retries ordered by priority (high first) then age, capped
    ListDueRetries {
        now_ms: i64,
        limit: usize,
        reply: oneshot::Sender<StateResponse<Vec<CallbackRequest>>>,
    },

    /// Calling requests whose last update is at or before the cutoff
    ListStaleCalling {
        cutoff_ms: i64,
        reply: oneshot::Sender<StateResponse<Vec<CallbackRequest>>>,
    },

    // Verification code operations
    CreateCode {
        code: VerificationCode,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    /// Most recent unverified code for (request, channel), expired or not
    GetActiveCode {
        request_id: String,
        channel: String,
        reply: oneshot::Sender<StateResponse<Option<VerificationCode>>>,
    },
    UpdateCode {
        code: VerificationCode,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Audit operations
    RecordAudit {
        record: AuditRecord,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    ListAudit {
        request_id: String,
        reply: oneshot::Sender<StateResponse<Vec<AuditRecord>>>,
    },

    // Shutdown
    Shutdown,
}
