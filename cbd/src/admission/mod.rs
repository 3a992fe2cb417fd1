//! Submission admission control
//!
//! Every submission walks a fixed gate chain before a request row may
//! exist:
//!
//! 1. Honeypot: the hidden `website` field is non-empty for bots only.
//!    Trips are silently "accepted" with an unpersisted id.
//! 2. Human-verification token: checked against the verifier endpoint,
//!    fails CLOSED.
//! 3. Daily cost cap: trailing-24h created count vs ceiling, fails OPEN.
//! 4. Duplicate suppression: stale Calling rows are reaped, then every
//!    other live request from the same contact is auto-cancelled in
//!    favor of the new one. Never rejects.
//! 5. Abuse fingerprint throttle: trailing-24h count per fingerprint vs
//!    ceiling, fails OPEN.
//!
//! Concurrency admission at dispatch time lives in [`ConcurrencyGate`].

mod concurrency;
mod token;

pub use concurrency::{ConcurrencyDecision, ConcurrencyGate};
pub use token::TokenVerifier;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use callstore::now_ms;

use crate::config::AdmissionConfig;
use crate::domain::{CallStatus, CallbackRequest, Priority};
use crate::events::{CbEvent, EventBus};
use crate::state::StateManager;

/// Trailing window for the cap and throttle gates
const TRAILING_DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Raw submission fields as they arrive from the CLI or a web front
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Destination number as typed by the visitor
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub priority: Option<Priority>,
    /// Hidden form field; humans leave it empty
    #[serde(default)]
    pub website: String,
    /// Human-verification token from the form
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub agent: String,
}

/// Rejection from one of the admission gates
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    #[error("Human verification failed. Please try again.")]
    HumanCheckFailed,
    #[error("Daily request limit reached. Please try again later.")]
    DailyCapReached,
    #[error("Too many requests from this source. Please try again later.")]
    FingerprintThrottled,
}

impl AdmissionError {
    /// Gate name as recorded in events and metrics
    pub fn gate(&self) -> &'static str {
        match self {
            Self::HumanCheckFailed => "human-check",
            Self::DailyCapReached => "daily-cap",
            Self::FingerprintThrottled => "fingerprint",
        }
    }

    /// HTTP-equivalent status for surfaces that map rejections onto one
    pub fn status_code(&self) -> u16 {
        match self {
            Self::HumanCheckFailed => 400,
            Self::DailyCapReached => 503,
            Self::FingerprintThrottled => 429,
        }
    }
}

/// Verdict for a submission that was not rejected
#[derive(Debug, Clone, PartialEq)]
pub enum Admitted {
    /// Every gate passed; persist the candidate and continue
    Accepted,
    /// Honeypot tripped: report success without persisting anything
    Pretend,
}

/// Runs the submission gate chain
pub struct AdmissionController {
    state: StateManager,
    bus: Arc<EventBus>,
    verifier: TokenVerifier,
    daily_cap: u64,
    fingerprint_ceiling: u64,
    duplicate_window_ms: i64,
    stale_calling_ms: i64,
}

impl AdmissionController {
    pub fn new(
        state: StateManager,
        bus: Arc<EventBus>,
        verifier: TokenVerifier,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            state,
            bus,
            verifier,
            daily_cap: config.daily_cap,
            fingerprint_ceiling: config.fingerprint_ceiling,
            duplicate_window_ms: i64::from(config.duplicate_window_mins) * 60 * 1000,
            stale_calling_ms: i64::from(config.stale_calling_secs) * 1000,
        }
    }

    /// Walk the gate chain for a candidate request
    ///
    /// The candidate carries the normalized phone, fingerprint and the id
    /// that will be persisted on acceptance; it is not yet in the store.
    pub async fn admit(
        &self,
        submission: &Submission,
        candidate: &CallbackRequest,
    ) -> Result<Admitted, AdmissionError> {
        if !submission.website.trim().is_empty() {
            info!(remote_addr = %submission.remote_addr, "Honeypot tripped; pretending success");
            self.bus.emit(CbEvent::HoneypotTripped {
                remote_addr: submission.remote_addr.clone(),
            });
            return Ok(Admitted::Pretend);
        }

        if !self
            .verifier
            .verify(submission.token.as_deref(), &submission.remote_addr)
            .await
        {
            return Err(self.reject(AdmissionError::HumanCheckFailed, "Token missing or rejected"));
        }

        let since = now_ms() - TRAILING_DAY_MS;
        match self.state.count_created_since(since).await {
            Ok(count) if count >= self.daily_cap => {
                let reason = format!("{count} requests in the last 24h (cap {})", self.daily_cap);
                return Err(self.reject(AdmissionError::DailyCapReached, &reason));
            }
            Ok(count) => debug!(count, cap = self.daily_cap, "admit: daily cap ok"),
            Err(error) => warn!(%error, "Daily cap count unavailable; allowing"),
        }

        self.suppress_duplicates(candidate).await;

        match self
            .state
            .count_by_fingerprint_since(&candidate.fingerprint, since)
            .await
        {
            Ok(count) if count >= self.fingerprint_ceiling => {
                let reason = format!(
                    "{count} requests sharing this fingerprint in the last 24h (ceiling {})",
                    self.fingerprint_ceiling
                );
                return Err(self.reject(AdmissionError::FingerprintThrottled, &reason));
            }
            Ok(count) => debug!(count, ceiling = self.fingerprint_ceiling, "admit: fingerprint ok"),
            Err(error) => warn!(%error, "Fingerprint count unavailable; allowing"),
        }

        Ok(Admitted::Accepted)
    }

    fn reject(&self, error: AdmissionError, reason: &str) -> AdmissionError {
        warn!(gate = error.gate(), reason, "Submission rejected");
        self.bus.emit(CbEvent::GateRejected {
            gate: error.gate().to_string(),
            reason: reason.to_string(),
        });
        error
    }

    /// Reap stuck Calling rows, then cancel live same-contact requests
    async fn suppress_duplicates(&self, candidate: &CallbackRequest) {
        let cutoff = now_ms() - self.stale_calling_ms;
        match self.state.list_stale_calling(cutoff).await {
            Ok(stale) => {
                for request in stale {
                    debug!(id = %request.id, "suppress_duplicates: reaping stale call");
                    if let Err(error) = self
                        .state
                        .transition(
                            &request.id,
                            CallStatus::Failed,
                            "Stale call reaped",
                            None,
                            None,
                            Some(vec![CallStatus::Calling]),
                        )
                        .await
                    {
                        warn!(id = %request.id, %error, "Stale-call reap failed");
                    }
                }
            }
            Err(error) => warn!(%error, "Stale-call listing unavailable"),
        }

        let since = now_ms() - self.duplicate_window_ms;
        match self.state.find_active_by_contact(&candidate.phone, since).await {
            Ok(duplicates) => {
                for dupe in duplicates {
                    info!(id = %dupe.id, superseded_by = %candidate.id, "Auto-cancelling duplicate request");
                    match self
                        .state
                        .transition(&dupe.id, CallStatus::Cancelled, "auto-cancelled", None, None, None)
                        .await
                    {
                        Ok(_) => self.bus.emit(CbEvent::DuplicateCancelled {
                            request_id: dupe.id,
                            superseded_by: candidate.id.clone(),
                        }),
                        Err(error) => warn!(id = %dupe.id, %error, "Duplicate cancel failed"),
                    }
                }
            }
            Err(error) => warn!(%error, "Duplicate lookup unavailable"),
        }
    }
}
