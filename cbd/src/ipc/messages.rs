//! IPC message types for daemon communication
//!
//! Simple JSON-over-newline protocol. Each message is a single line of
//! JSON followed by `\n`.

use serde::{Deserialize, Serialize};

use crate::admission::Submission;
use crate::domain::{CallStatus, CallbackRequest};
use crate::events::AuditRecord;
use crate::metrics::WorkerStats;

/// Messages from the CLI to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Check if the daemon is alive
    Ping,

    /// Request graceful shutdown
    Shutdown,

    /// Run a visitor submission through the admission chain
    Submit { submission: Submission },

    /// Issue (or re-send) a verification code
    RequestCode { id: String },

    /// Check a verification code
    Verify { id: String, code: String },

    /// Dispatch a call for a verified request
    Initiate { id: String },

    /// Cancel a request
    Cancel { id: String },

    /// Feed a provider-reported call outcome into the daemon
    Outcome {
        id: String,
        status: String,
        duration_secs: u32,
    },

    /// Fetch one request with its audit trail
    Show { id: String },

    /// List requests, optionally filtered by status
    List { status: Option<CallStatus> },

    /// Daemon liveness, store counts, and worker stats
    Status,

    /// Metrics snapshot
    Metrics,
}

/// Daemon liveness and store summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub version: String,
    /// Requests per status
    pub counts: Vec<(String, u64)>,
    /// Requests per priority, high first
    pub priorities: Vec<(String, u64)>,
    pub workers: Vec<WorkerStats>,
}

/// Responses from the daemon to the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    /// Acknowledgment
    Ok,

    /// Pong response to ping
    Pong { version: String },

    /// A single request row
    Request { request: CallbackRequest },

    /// A list of request rows
    Requests { requests: Vec<CallbackRequest> },

    /// A request together with its audit trail
    Inspection {
        request: CallbackRequest,
        trail: Vec<AuditRecord>,
    },

    /// A verification code was issued; the code itself travels only
    /// over the notification channel
    CodeIssued {
        request_id: String,
        channel: String,
        expires_at: i64,
    },

    /// Daemon status report
    Status { report: StatusReport },

    /// Metrics snapshot
    Metrics { snapshot: serde_json::Value },

    /// Error response
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_serialize() {
        let msg = DaemonMessage::Ping;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Ping"}"#);
    }

    #[test]
    fn test_shutdown_serialize() {
        let msg = DaemonMessage::Shutdown;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Shutdown"}"#);
    }

    #[test]
    fn test_verify_serialize() {
        let msg = DaemonMessage::Verify {
            id: "abc-call-1".to_string(),
            code: "123456".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Verify","id":"abc-call-1","code":"123456"}"#);
    }

    #[test]
    fn test_outcome_deserialize() {
        let json = r#"{"type":"Outcome","id":"abc-call-1","status":"no-answer","duration_secs":0}"#;
        let msg: DaemonMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            DaemonMessage::Outcome {
                id: "abc-call-1".to_string(),
                status: "no-answer".to_string(),
                duration_secs: 0,
            }
        );
    }

    #[test]
    fn test_ok_response_serialize() {
        let resp = DaemonResponse::Ok;
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"Ok"}"#);
    }

    #[test]
    fn test_pong_response_serialize() {
        let resp = DaemonResponse::Pong {
            version: "1.0.0".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"Pong","version":"1.0.0"}"#);
    }

    #[test]
    fn test_error_response_serialize() {
        let resp = DaemonResponse::Error {
            message: "Record not found: abc".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"Error","message":"Record not found: abc"}"#);
    }

    #[test]
    fn test_roundtrip_all_messages() {
        let submission = Submission {
            phone: "(321) 704-7403".to_string(),
            name: Some("Ada".to_string()),
            remote_addr: "203.0.113.9".to_string(),
            agent: "Mozilla/5.0".to_string(),
            ..Default::default()
        };
        let messages = vec![
            DaemonMessage::Ping,
            DaemonMessage::Shutdown,
            DaemonMessage::Submit { submission },
            DaemonMessage::RequestCode { id: "r-1".to_string() },
            DaemonMessage::Verify {
                id: "r-1".to_string(),
                code: "123456".to_string(),
            },
            DaemonMessage::Initiate { id: "r-1".to_string() },
            DaemonMessage::Cancel { id: "r-1".to_string() },
            DaemonMessage::Outcome {
                id: "r-1".to_string(),
                status: "completed".to_string(),
                duration_secs: 45,
            },
            DaemonMessage::Show { id: "r-1".to_string() },
            DaemonMessage::List { status: None },
            DaemonMessage::List {
                status: Some(CallStatus::Calling),
            },
            DaemonMessage::Status,
            DaemonMessage::Metrics,
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: DaemonMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, parsed);
        }
    }

    #[test]
    fn test_roundtrip_payload_responses() {
        let request = CallbackRequest::with_id("r-1", "+13217047403");
        let responses = vec![
            DaemonResponse::Request {
                request: request.clone(),
            },
            DaemonResponse::Requests {
                requests: vec![request.clone()],
            },
            DaemonResponse::Inspection {
                request,
                trail: Vec::new(),
            },
            DaemonResponse::CodeIssued {
                request_id: "r-1".to_string(),
                channel: "sms".to_string(),
                expires_at: 1_700_000_000_000,
            },
            DaemonResponse::Status {
                report: StatusReport {
                    version: "test".to_string(),
                    counts: vec![("pending".to_string(), 2)],
                    priorities: vec![("high".to_string(), 1)],
                    workers: Vec::new(),
                },
            },
            DaemonResponse::Metrics {
                snapshot: serde_json::json!({"notifications": 0}),
            },
        ];

        for resp in responses {
            let json = serde_json::to_string(&resp).unwrap();
            let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
            assert_eq!(resp, parsed);
        }
    }
}
