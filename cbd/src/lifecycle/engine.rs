//! Lifecycle engine
//!
//! The orchestrator proper: submission through the admission chain,
//! verification, dispatch through the provider, outcome ingestion, and
//! the sweep bodies the schedulers drive. Every status write goes
//! through the state manager's guarded transitions; the engine decides
//! which transition to ask for.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use callstore::now_ms;

use crate::admission::{
    Admitted, AdmissionController, AdmissionError, ConcurrencyDecision, ConcurrencyGate, Submission,
};
use crate::config::Config;
use crate::domain::{CallStatus, CallbackRequest, VerificationCode, normalize_phone};
use crate::events::{CbEvent, EventBus};
use crate::notify::Notifier;
use crate::provider::{Provider, ProviderError};
use crate::scheduler::retry::backoff;
use crate::state::{StateError, StateManager};
use crate::verify::{DEFAULT_CHANNEL, Verifier, VerifyError};

use super::hours::{self, HoursDecision};
use super::outcome::{self, OutcomeClass};

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad caller input; nothing was persisted
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// A concurrency ceiling was hit under the reject policy
    #[error("{0}")]
    Overloaded(String),

    #[error("Request {id} cannot be dispatched from {status}")]
    NotDispatchable { id: String, status: CallStatus },

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Drives callback requests through their lifecycle
pub struct Engine {
    state: StateManager,
    bus: Arc<EventBus>,
    provider: Arc<dyn Provider>,
    admission: AdmissionController,
    gate: ConcurrencyGate,
    verifier: Verifier,
    notifier: Arc<Notifier>,
    config: Config,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        bus: Arc<EventBus>,
        provider: Arc<dyn Provider>,
        admission: AdmissionController,
        gate: ConcurrencyGate,
        verifier: Verifier,
        notifier: Arc<Notifier>,
        config: Config,
    ) -> Self {
        Self {
            state,
            bus,
            provider,
            admission,
            gate,
            verifier,
            notifier,
            config,
        }
    }

    /// Accept a visitor submission through the admission chain
    ///
    /// Returns the created request, or a request-shaped phantom when the
    /// honeypot tripped (the caller cannot tell the difference, which is
    /// the point).
    pub async fn submit(&self, submission: &Submission) -> Result<CallbackRequest, EngineError> {
        let phone = normalize_phone(&submission.phone, &self.config.admission.default_country)
            .map_err(EngineError::InvalidInput)?;

        let mut candidate = CallbackRequest::new(phone)
            .with_origin(&submission.remote_addr, &submission.agent)
            .with_max_retries(self.config.retry.max_retries);
        if let Some(name) = &submission.name {
            candidate = candidate.with_name(name);
        }
        if let Some(email) = &submission.email {
            candidate = candidate.with_email(email);
        }
        if let Some(priority) = submission.priority {
            candidate = candidate.with_priority(priority);
        }

        if self.admission.admit(submission, &candidate).await? == Admitted::Pretend {
            return Ok(candidate);
        }

        self.state.create_request(candidate.clone()).await?;
        info!(request_id = %candidate.id, phone = %candidate.phone, "Callback request accepted");
        Ok(candidate)
    }

    /// Issue (or re-send) a verification code for a pending request
    pub async fn request_code(&self, request_id: &str) -> Result<VerificationCode, EngineError> {
        Ok(self.verifier.issue(request_id, DEFAULT_CHANNEL).await?)
    }

    /// Check a verification code; on success the request becomes Verified
    ///
    /// Under the deferred commit mode the returned request may still read
    /// Pending; the transition lands from a follow-up task.
    pub async fn verify(&self, request_id: &str, code: &str) -> Result<CallbackRequest, EngineError> {
        self.verifier.check(request_id, DEFAULT_CHANNEL, code).await?;
        Ok(self.state.get_request_required(request_id).await?)
    }

    /// Dispatch a call for a Verified or due RetryScheduled request
    ///
    /// Checks business hours, then the concurrency gate, then places the
    /// call. A synchronous provider failure is recorded and routed
    /// through the failure handler; the returned request reflects
    /// whatever the dispatch settled on.
    pub async fn dispatch(&self, request_id: &str) -> Result<CallbackRequest, EngineError> {
        let request = self.state.get_request_required(request_id).await?;
        if !matches!(request.status, CallStatus::Verified | CallStatus::RetryScheduled) {
            return Err(EngineError::NotDispatchable {
                id: request.id,
                status: request.status,
            });
        }

        let hours = hours::evaluate(&self.config.hours);
        if !hours.open {
            return self.dispatch_closed(request, &hours).await;
        }

        if let ConcurrencyDecision::Deny { reason } = self.gate.admit_call().await {
            return Err(EngineError::Overloaded(reason));
        }

        self.place(request).await
    }

    /// Outside business hours: text the business instead of calling
    ///
    /// Only an initial dispatch settles as SmsSent; a due retry stays
    /// booked for the next sweep inside the window.
    async fn dispatch_closed(
        &self,
        request: CallbackRequest,
        hours: &HoursDecision,
    ) -> Result<CallbackRequest, EngineError> {
        if request.status != CallStatus::Verified {
            info!(request_id = %request.id, reason = %hours.message, "Dispatch deferred");
            return Ok(request);
        }

        let message_ref = self.notifier.after_hours(&request).await;
        let updated = self
            .state
            .transition(
                &request.id,
                CallStatus::SmsSent,
                format!("SMS sent ({})", hours.message),
                None,
                message_ref,
                Some(vec![CallStatus::Verified]),
            )
            .await?;
        info!(request_id = %updated.id, reason = %hours.message, "After-hours SMS sent instead of calling");
        Ok(updated)
    }

    /// Place the call and record what happened
    async fn place(&self, request: CallbackRequest) -> Result<CallbackRequest, EngineError> {
        let destination = self.destination_for(&request).to_string();
        if destination.is_empty() {
            return Err(EngineError::NotConfigured("notify.business-phone"));
        }

        let caller_id = &self.config.provider.service_number;
        let attempt = request.retry_count + 1;
        debug!(request_id = %request.id, %destination, attempt, "place: calling provider");

        match self.provider.place_call(&destination, caller_id, &request.id).await {
            Ok(receipt) => {
                self.bus.emit(CbEvent::DispatchAttempted {
                    request_id: request.id.clone(),
                    destination,
                    provider: self.provider.name().to_string(),
                    attempt,
                });
                let updated = self
                    .state
                    .transition(
                        &request.id,
                        CallStatus::Calling,
                        "Calling business",
                        Some(receipt.reference.clone()),
                        None,
                        Some(vec![CallStatus::Verified, CallStatus::RetryScheduled]),
                    )
                    .await?;
                info!(request_id = %updated.id, call_ref = %receipt.reference, attempt, "Call placed");
                Ok(updated)
            }
            Err(error) => {
                warn!(request_id = %request.id, %error, attempt, "Call placement failed");
                let failed = self
                    .state
                    .transition(
                        &request.id,
                        CallStatus::Failed,
                        format!("Call failed: {error}"),
                        None,
                        None,
                        Some(vec![CallStatus::Verified, CallStatus::RetryScheduled]),
                    )
                    .await?;
                self.handle_failure(&failed).await
            }
        }
    }

    /// Ingest a provider-reported call outcome
    ///
    /// Outcomes for settled requests (completed, cancelled, dead-lettered)
    /// are logged no-ops; the provider call simply outlived the row.
    pub async fn record_outcome(
        &self,
        request_id: &str,
        raw_status: &str,
        duration_secs: u32,
    ) -> Result<CallbackRequest, EngineError> {
        let request = self.state.get_request_required(request_id).await?;

        if request.status != CallStatus::Calling {
            info!(
                request_id,
                status = %request.status,
                outcome = raw_status,
                "Outcome for a request no longer in flight; ignoring"
            );
            return Ok(request);
        }

        let class = outcome::classify(raw_status, duration_secs, self.config.calls.min_call_secs);
        self.bus.emit(CbEvent::OutcomeReceived {
            request_id: request_id.to_string(),
            outcome: match &class {
                OutcomeClass::Completed => "completed".to_string(),
                OutcomeClass::Failed { reason } => reason.clone(),
                OutcomeClass::Ignored => raw_status.trim().to_ascii_lowercase(),
            },
            duration_secs,
        });

        let Some(message) = class.status_message() else {
            debug!(request_id, outcome = raw_status, "Interim outcome ignored");
            return Ok(request);
        };

        if matches!(class, OutcomeClass::Completed) {
            let updated = self
                .state
                .transition(
                    request_id,
                    CallStatus::Completed,
                    message,
                    None,
                    None,
                    Some(vec![CallStatus::Calling]),
                )
                .await?;
            info!(request_id, duration_secs, "Call completed");
            Ok(updated)
        } else {
            let failed = self
                .state
                .transition(
                    request_id,
                    CallStatus::Failed,
                    message,
                    None,
                    None,
                    Some(vec![CallStatus::Calling]),
                )
                .await?;
            self.handle_failure(&failed).await
        }
    }

    /// Cancel a request from any non-terminal status
    pub async fn cancel(&self, request_id: &str) -> Result<CallbackRequest, EngineError> {
        let updated = self
            .state
            .transition(request_id, CallStatus::Cancelled, "Cancelled by operator", None, None, None)
            .await?;
        info!(request_id, "Request cancelled");
        Ok(updated)
    }

    /// Book a retry for a freshly Failed request, or dead-letter it
    ///
    /// `retry_count` on the passed request does not yet include the
    /// failure being handled; the state manager counts it as part of the
    /// follow-up write.
    async fn handle_failure(&self, request: &CallbackRequest) -> Result<CallbackRequest, EngineError> {
        let attempt = request.retry_count + 1;

        if attempt <= request.max_retries {
            let next_retry_at = now_ms() + i64::from(backoff(attempt)) * 1000;
            let updated = self
                .state
                .schedule_retry(
                    &request.id,
                    format!("Retry {attempt} of {} scheduled", request.max_retries),
                    next_retry_at,
                )
                .await?;
            info!(request_id = %request.id, attempt, next_retry_at, "Retry scheduled");
            self.notifier.missed_call(request).await;
            Ok(updated)
        } else {
            let updated = self
                .state
                .dead_letter(&request.id, format!("Retries exhausted after {attempt} attempts"))
                .await?;
            warn!(request_id = %request.id, attempt, "Retries exhausted; dead-lettering");
            self.notifier.dead_letter(request).await;
            Ok(updated)
        }
    }

    /// One pass of the due-retry sweep; returns how many calls were placed
    ///
    /// Skipped entirely outside business hours so due rows stay booked
    /// for the next sweep inside the window.
    pub async fn retry_sweep(&self) -> Result<usize, EngineError> {
        let hours = hours::evaluate(&self.config.hours);
        if !hours.open {
            debug!(reason = %hours.message, "retry_sweep: outside business hours, skipping");
            return Ok(0);
        }

        let due = self
            .state
            .list_due_retries(now_ms(), self.config.retry.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(due = due.len(), "retry_sweep: dispatching due retries");
        let mut placed = 0;
        for request in due {
            match self.dispatch(&request.id).await {
                Ok(updated) => {
                    if updated.status == CallStatus::Calling {
                        placed += 1;
                    }
                }
                // Moved by another actor since the listing; not ours anymore
                Err(EngineError::NotDispatchable { .. }) => continue,
                Err(EngineError::Overloaded(reason)) => {
                    debug!(request_id = %request.id, %reason, "retry_sweep: ceiling hit, ending batch");
                    break;
                }
                Err(error) => {
                    warn!(request_id = %request.id, %error, "Retry dispatch failed");
                }
            }
        }
        Ok(placed)
    }

    /// One pass of the escalation sweep; returns how many calls advanced
    pub async fn escalation_sweep(&self) -> Result<usize, EngineError> {
        let timeout_ms = self.config.escalation.timeout_secs as i64 * 1000;
        let calling = self.state.list_requests(Some(CallStatus::Calling)).await?;
        let now = now_ms();

        let mut advanced = 0;
        for request in calling {
            if now - request.escalation_anchor() < timeout_ms {
                continue;
            }
            // Advancing from level N dials targets[N]; past the end the
            // chain is exhausted and the row is left alone
            let Some(target) = self
                .config
                .escalation
                .targets
                .get(request.escalation_level as usize)
            else {
                debug!(
                    request_id = %request.id,
                    level = request.escalation_level,
                    "escalation_sweep: chain exhausted"
                );
                continue;
            };

            match self.escalate(&request, target).await {
                Ok(()) => advanced += 1,
                Err(error) => {
                    warn!(request_id = %request.id, %error, "Escalation dispatch failed");
                }
            }
        }
        Ok(advanced)
    }

    /// Re-dispatch a stuck call to the next escalation target
    ///
    /// The original leg may still be ringing, so a placement failure
    /// changes nothing; the row stays eligible for the next sweep.
    async fn escalate(&self, request: &CallbackRequest, target: &str) -> Result<(), EngineError> {
        let receipt = self
            .provider
            .place_call(target, &self.config.provider.service_number, &request.id)
            .await?;

        self.bus.emit(CbEvent::DispatchAttempted {
            request_id: request.id.clone(),
            destination: target.to_string(),
            provider: self.provider.name().to_string(),
            attempt: request.retry_count + 1,
        });
        let updated = self
            .state
            .record_escalation(
                &request.id,
                target,
                Some(receipt.reference),
                format!("Escalated to {target}"),
            )
            .await?;
        info!(request_id = %updated.id, level = updated.escalation_level, %target, "Call escalated");
        Ok(())
    }

    /// Route requests stranded by a crash back into the retry path
    ///
    /// Calling rows older than the stale timeout lost their provider
    /// callback; Failed rows missed their follow-up booking. Both go
    /// through the normal failure handler.
    pub async fn recover_on_startup(&self) -> Result<(), EngineError> {
        let cutoff = now_ms() - i64::from(self.config.admission.stale_calling_secs) * 1000;
        let stale = self.state.list_stale_calling(cutoff).await?;
        let stale_count = stale.len();
        for request in stale {
            let failed = self
                .state
                .transition(
                    &request.id,
                    CallStatus::Failed,
                    "Call interrupted by restart",
                    None,
                    None,
                    Some(vec![CallStatus::Calling]),
                )
                .await;
            match failed {
                Ok(failed) => {
                    self.followup_tolerant(&failed).await?;
                }
                Err(StateError::InvalidTransition { .. }) | Err(StateError::NotFound(_)) => continue,
                Err(error) => return Err(error.into()),
            }
        }

        let resting = self.state.list_requests(Some(CallStatus::Failed)).await?;
        let resting_count = resting.len();
        for request in &resting {
            self.followup_tolerant(request).await?;
        }

        if stale_count > 0 || resting_count > 0 {
            info!(stale = stale_count, resting = resting_count, "Recovered interrupted requests");
        }
        Ok(())
    }

    /// handle_failure that shrugs off rows concurrently moved elsewhere
    async fn followup_tolerant(&self, request: &CallbackRequest) -> Result<(), EngineError> {
        match self.handle_failure(request).await {
            Ok(_) => Ok(()),
            Err(EngineError::State(StateError::InvalidTransition { .. }))
            | Err(EngineError::State(StateError::NotFound(_))) => {
                debug!(request_id = %request.id, "recover: row moved concurrently, skipping");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Destination for the next call: the escalated target when one is
    /// set, else the business line
    fn destination_for<'a>(&'a self, request: &'a CallbackRequest) -> &'a str {
        request
            .escalated_to
            .as_deref()
            .unwrap_or(&self.config.notify.business_phone)
    }
}
