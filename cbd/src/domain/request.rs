//! CallbackRequest domain type
//!
//! Tracks a single callback request from submission to terminal outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callstore::{IndexValue, Record, now_ms};

use super::fingerprint::fingerprint;
use super::id::generate_id;
use super::priority::Priority;

/// Callback request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Submitted, awaiting contact verification
    #[default]
    Pending,
    /// Contact verified, eligible for dispatch
    Verified,
    /// Outbound call in flight
    Calling,
    /// Call answered and long enough to count as a conversation
    Completed,
    /// Dispatch or call failed; the failure handler decides what follows
    Failed,
    /// Waiting for its next dispatch attempt
    RetryScheduled,
    /// Retries exhausted; both parties notified
    DeadLetter,
    /// Withdrawn by the caller or duplicate suppression
    Cancelled,
    /// Outside business hours; SMS sent instead of calling
    SmsSent,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Verified => write!(f, "verified"),
            Self::Calling => write!(f, "calling"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::DeadLetter => write!(f, "dead_letter"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SmsSent => write!(f, "sms_sent"),
        }
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "calling" => Ok(Self::Calling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "dead_letter" => Ok(Self::DeadLetter),
            "cancelled" => Ok(Self::Cancelled),
            "sms_sent" => Ok(Self::SmsSent),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

impl CallStatus {
    /// No outgoing edges from these states
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter | Self::Cancelled | Self::SmsSent)
    }

    /// Whether a direct transition from self to `to` is legal
    ///
    /// Cancel is reachable from every non-terminal state; everything else
    /// follows the dispatch path.
    pub fn can_transition_to(self, to: CallStatus) -> bool {
        use CallStatus::*;
        if to == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Pending, Verified)
                | (Verified, Calling)
                | (Verified, SmsSent)
                | (Calling, Completed)
                | (Calling, Failed)
                | (Failed, RetryScheduled)
                | (Failed, DeadLetter)
                | (RetryScheduled, Calling)
        )
    }
}

/// A visitor's request to be called back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRequest {
    /// Unique identifier
    pub id: String,

    /// Normalized E.164 destination number
    pub phone: String,

    /// Visitor name, if given
    #[serde(default)]
    pub name: Option<String>,

    /// Visitor email, if given
    #[serde(default)]
    pub email: Option<String>,

    /// Current status
    pub status: CallStatus,

    /// Human-readable note for the current status
    pub status_message: String,

    /// Dispatch priority
    #[serde(default)]
    pub priority: Priority,

    /// Provider reference for the last placed call
    pub call_ref: Option<String>,

    /// Provider reference for the last sent message
    pub message_ref: Option<String>,

    /// Dispatch attempts that have failed so far
    pub retry_count: u32,

    /// Retry budget before dead-lettering
    pub max_retries: u32,

    /// When the next retry is due (Unix ms)
    pub next_retry_at: Option<i64>,

    /// When the last retry was dispatched (Unix ms)
    pub last_retry_at: Option<i64>,

    /// How many times the call has been escalated down the fallback chain
    pub escalation_level: u32,

    /// When the last escalation advanced (Unix ms)
    pub escalation_at: Option<i64>,

    /// Destination the call is currently escalated to
    pub escalated_to: Option<String>,

    /// Abuse fingerprint (sha256 hex over origin + agent + contact)
    pub fingerprint: String,

    /// Submitter network address
    pub remote_addr: String,

    /// Submitter agent string
    pub agent: String,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

/// Default retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 3;

impl CallbackRequest {
    /// Create a new request with a generated ID
    pub fn new(phone: impl Into<String>) -> Self {
        let phone = phone.into();
        let now = now_ms();

        Self {
            id: generate_id("call", &phone),
            phone,
            name: None,
            email: None,
            status: CallStatus::Pending,
            status_message: "Awaiting verification".to_string(),
            priority: Priority::Default,
            call_ref: None,
            message_ref: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            last_retry_at: None,
            escalation_level: 0,
            escalation_at: None,
            escalated_to: None,
            fingerprint: String::new(),
            remote_addr: String::new(),
            agent: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create with a specific ID (for testing or recovery)
    pub fn with_id(id: impl Into<String>, phone: impl Into<String>) -> Self {
        let mut request = Self::new(phone);
        request.id = id.into();
        request
    }

    /// Builder method to set the visitor name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder method to set the visitor email
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Builder method to set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method recording the submission origin and its fingerprint
    pub fn with_origin(mut self, remote_addr: impl Into<String>, agent: impl Into<String>) -> Self {
        self.remote_addr = remote_addr.into();
        self.agent = agent.into();
        self.fingerprint = fingerprint(&self.remote_addr, &self.agent, &self.phone);
        self
    }

    /// Update the status and its message
    pub fn set_status(&mut self, status: CallStatus, message: impl Into<String>) {
        self.status = status;
        self.status_message = message.into();
        self.updated_at = now_ms();
    }

    /// Record the provider reference for a placed call
    pub fn set_call_ref(&mut self, call_ref: impl Into<String>) {
        self.call_ref = Some(call_ref.into());
        self.updated_at = now_ms();
    }

    /// Record the provider reference for a sent message
    pub fn set_message_ref(&mut self, message_ref: impl Into<String>) {
        self.message_ref = Some(message_ref.into());
        self.updated_at = now_ms();
    }

    /// Count a failed attempt and book the next one
    pub fn schedule_retry(&mut self, next_retry_at: i64) {
        self.retry_count += 1;
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = now_ms();
    }

    /// Count a failed attempt without booking another (dead-letter path)
    pub fn record_failed_attempt(&mut self) {
        self.retry_count += 1;
        self.next_retry_at = None;
        self.updated_at = now_ms();
    }

    /// Mark the booked retry as dispatched
    pub fn consume_retry(&mut self) {
        self.last_retry_at = Some(now_ms());
        self.next_retry_at = None;
        self.updated_at = now_ms();
    }

    /// Advance one level down the escalation chain
    pub fn advance_escalation(&mut self, target: impl Into<String>) {
        self.escalation_level += 1;
        self.escalation_at = Some(now_ms());
        self.escalated_to = Some(target.into());
        self.updated_at = now_ms();
    }

    /// Check if the request is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if a call is in flight
    pub fn is_active(&self) -> bool {
        matches!(self.status, CallStatus::Calling)
    }

    /// Check if the retry budget is spent
    ///
    /// `retry_count` at this point includes the attempt that just failed.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    /// Timestamp the escalation timeout is measured from
    pub fn escalation_anchor(&self) -> i64 {
        self.escalation_at.unwrap_or(self.created_at)
    }
}

impl Record for CallbackRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "callback_requests"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("priority".to_string(), IndexValue::String(self.priority.to_string()));
        fields.insert("phone".to_string(), IndexValue::String(self.phone.clone()));
        fields.insert("created_at".to_string(), IndexValue::Integer(self.created_at));
        if !self.fingerprint.is_empty() {
            fields.insert("fingerprint".to_string(), IndexValue::String(self.fingerprint.clone()));
        }
        if let Some(next_retry_at) = self.next_retry_at {
            fields.insert("next_retry_at".to_string(), IndexValue::Integer(next_retry_at));
        }
        fields
    }
}
