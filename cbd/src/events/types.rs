//! Event types for callback activity streaming
//!
//! Every state-affecting action in the daemon emits one of these:
//! - admission decisions (gates, honeypot, duplicates)
//! - lifecycle transitions and provider dispatches
//! - verification activity
//! - retry/escalation scheduling and notifications
//! - worker supervision
//!
//! Events are broadcast on the bus and persisted as AuditRecords so the
//! full history of a request is queryable afterward.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callstore::{IndexValue, Record, now_ms};

use crate::domain::CallStatus;

/// Core event enum - the vocabulary of callback activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CbEvent {
    // === Admission ===
    /// A submission passed every gate and was persisted
    RequestSubmitted {
        request_id: String,
        phone: String,
        priority: String,
    },
    /// A submission was rejected by an admission gate
    GateRejected { gate: String, reason: String },
    /// The hidden form field was filled in; nothing was persisted
    HoneypotTripped { remote_addr: String },
    /// An earlier request for the same contact was auto-cancelled
    DuplicateCancelled {
        request_id: String,
        superseded_by: String,
    },

    // === Lifecycle ===
    /// A request moved between statuses
    StatusChanged {
        request_id: String,
        from: CallStatus,
        to: CallStatus,
        message: String,
    },
    /// An outbound call or message was handed to the provider
    DispatchAttempted {
        request_id: String,
        destination: String,
        provider: String,
        attempt: u32,
    },
    /// The provider reported how a call ended
    OutcomeReceived {
        request_id: String,
        outcome: String,
        duration_secs: u32,
    },

    // === Verification ===
    /// A verification code was issued and sent
    CodeIssued { request_id: String, channel: String },
    /// A verification code was accepted
    CodeVerified { request_id: String, channel: String },
    /// A verification check failed
    CodeRejected {
        request_id: String,
        channel: String,
        reason: String,
    },

    // === Scheduling ===
    /// A failed request was booked for another attempt
    RetryScheduled {
        request_id: String,
        retry_count: u32,
        next_retry_at: i64,
    },
    /// A request ran out of retries
    DeadLettered { request_id: String, retry_count: u32 },
    /// A stuck call advanced down the escalation chain
    EscalationAdvanced {
        request_id: String,
        level: u32,
        target: String,
    },

    // === Notifications & workers ===
    /// A best-effort SMS notification went out
    NotificationSent {
        request_id: String,
        recipient: String,
        purpose: String,
    },
    /// A supervised worker was restarted after a fault
    WorkerRestarted {
        worker: String,
        consecutive_failures: u32,
    },
}

impl CbEvent {
    /// Request this event belongs to, when it belongs to one
    pub fn request_id(&self) -> Option<&str> {
        match self {
            CbEvent::RequestSubmitted { request_id, .. }
            | CbEvent::DuplicateCancelled { request_id, .. }
            | CbEvent::StatusChanged { request_id, .. }
            | CbEvent::DispatchAttempted { request_id, .. }
            | CbEvent::OutcomeReceived { request_id, .. }
            | CbEvent::CodeIssued { request_id, .. }
            | CbEvent::CodeVerified { request_id, .. }
            | CbEvent::CodeRejected { request_id, .. }
            | CbEvent::RetryScheduled { request_id, .. }
            | CbEvent::DeadLettered { request_id, .. }
            | CbEvent::EscalationAdvanced { request_id, .. }
            | CbEvent::NotificationSent { request_id, .. } => Some(request_id),
            CbEvent::GateRejected { .. } | CbEvent::HoneypotTripped { .. } | CbEvent::WorkerRestarted { .. } => None,
        }
    }

    /// Event kind name, identical to the serde tag
    pub fn kind(&self) -> &'static str {
        match self {
            CbEvent::RequestSubmitted { .. } => "RequestSubmitted",
            CbEvent::GateRejected { .. } => "GateRejected",
            CbEvent::HoneypotTripped { .. } => "HoneypotTripped",
            CbEvent::DuplicateCancelled { .. } => "DuplicateCancelled",
            CbEvent::StatusChanged { .. } => "StatusChanged",
            CbEvent::DispatchAttempted { .. } => "DispatchAttempted",
            CbEvent::OutcomeReceived { .. } => "OutcomeReceived",
            CbEvent::CodeIssued { .. } => "CodeIssued",
            CbEvent::CodeVerified { .. } => "CodeVerified",
            CbEvent::CodeRejected { .. } => "CodeRejected",
            CbEvent::RetryScheduled { .. } => "RetryScheduled",
            CbEvent::DeadLettered { .. } => "DeadLettered",
            CbEvent::EscalationAdvanced { .. } => "EscalationAdvanced",
            CbEvent::NotificationSent { .. } => "NotificationSent",
            CbEvent::WorkerRestarted { .. } => "WorkerRestarted",
        }
    }
}

/// A persisted audit event
///
/// Append-only: created once by the audit sink and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique identifier (plain UUIDv7)
    pub id: String,

    /// Request the event belongs to, if any
    pub request_id: Option<String>,

    /// The event payload
    pub event: CbEvent,

    /// When the event was recorded (Unix milliseconds)
    pub created_at: i64,
}

impl AuditRecord {
    /// Wrap an event for persistence
    pub fn new(event: CbEvent) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            request_id: event.request_id().map(String::from),
            event,
            created_at: now_ms(),
        }
    }
}

impl Record for AuditRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "audit_events"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("kind".to_string(), IndexValue::String(self.event.kind().to_string()));
        fields.insert("created_at".to_string(), IndexValue::Integer(self.created_at));
        if let Some(ref request_id) = self.request_id {
            fields.insert("request_id".to_string(), IndexValue::String(request_id.clone()));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_request_id() {
        let event = CbEvent::StatusChanged {
            request_id: "abc-call-1".to_string(),
            from: CallStatus::Pending,
            to: CallStatus::Verified,
            message: "Contact verified".to_string(),
        };
        assert_eq!(event.request_id(), Some("abc-call-1"));

        let event = CbEvent::GateRejected {
            gate: "fingerprint".to_string(),
            reason: "too many requests".to_string(),
        };
        assert_eq!(event.request_id(), None);

        let event = CbEvent::WorkerRestarted {
            worker: "retry-sweep".to_string(),
            consecutive_failures: 2,
        };
        assert_eq!(event.request_id(), None);
    }

    #[test]
    fn test_event_kind_matches_serde_tag() {
        let event = CbEvent::RetryScheduled {
            request_id: "abc-call-1".to_string(),
            retry_count: 1,
            next_retry_at: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = CbEvent::OutcomeReceived {
            request_id: "abc-call-1".to_string(),
            outcome: "no-answer".to_string(),
            duration_secs: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: CbEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_audit_record_wraps_event() {
        let record = AuditRecord::new(CbEvent::CodeIssued {
            request_id: "abc-call-1".to_string(),
            channel: "sms".to_string(),
        });
        assert_eq!(record.request_id.as_deref(), Some("abc-call-1"));
        assert!(record.created_at > 0);

        let fields = record.indexed_fields();
        assert_eq!(fields.get("kind"), Some(&IndexValue::String("CodeIssued".to_string())));
        assert!(fields.contains_key("request_id"));
        assert!(fields.contains_key("created_at"));
    }

    #[test]
    fn test_audit_record_without_request() {
        let record = AuditRecord::new(CbEvent::HoneypotTripped {
            remote_addr: "203.0.113.9".to_string(),
        });
        assert!(record.request_id.is_none());
        assert!(!record.indexed_fields().contains_key("request_id"));
    }
}
