//! VerificationCode domain type
//!
//! One-time numeric codes proving the visitor controls the contact they
//! asked to be called on. A code stays live until it is verified, expires,
//! or burns through its attempt budget.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callstore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// A verification code issued for a request on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCode {
    /// Unique identifier
    pub id: String,

    /// Request this code verifies
    pub request_id: String,

    /// Delivery channel (currently "sms")
    pub channel: String,

    /// The numeric code itself
    pub code: String,

    /// Contact the code was sent to
    pub contact: String,

    /// Check attempts consumed so far
    pub attempts: u32,

    /// Whether the code has been accepted
    pub verified: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Expiry timestamp (Unix milliseconds)
    pub expires_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl VerificationCode {
    /// Create a new unverified code
    pub fn new(
        request_id: impl Into<String>,
        channel: impl Into<String>,
        contact: impl Into<String>,
        code: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        let contact = contact.into();
        let now = now_ms();
        Self {
            id: generate_id("code", &contact),
            request_id: request_id.into(),
            channel: channel.into(),
            code: code.into(),
            contact,
            attempts: 0,
            verified: false,
            created_at: now,
            expires_at,
            updated_at: now,
        }
    }

    /// Whether the code has passed its expiry
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Whether the code can still be checked: unverified and unexpired
    pub fn is_usable(&self, now: i64) -> bool {
        !self.verified && !self.is_expired(now)
    }

    /// Count a check attempt
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.updated_at = now_ms();
    }

    /// Mark the code as accepted
    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.updated_at = now_ms();
    }

    /// Whether the attempt budget is spent
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

impl Record for VerificationCode {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "verification_codes"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("request_id".to_string(), IndexValue::String(self.request_id.clone()));
        fields.insert("channel".to_string(), IndexValue::String(self.channel.clone()));
        fields.insert("verified".to_string(), IndexValue::Integer(self.verified as i64));
        fields
    }
}
