//! Contact verification
//!
//! One-time numeric codes texted to the visitor prove they control the
//! number they asked to be called on. A code stays live until verified,
//! expired or out of attempts; issuing while a usable code exists
//! re-sends that code instead of minting a second one.
//!
//! On a successful check two writes happen: the verified flag on the
//! code and the Pending→Verified status transition. Their ordering is
//! the configured commit mode, and every write is counted in the
//! metrics commit ledger.

use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use callstore::now_ms;

use crate::config::{CommitMode, VerificationConfig};
use crate::domain::{CallStatus, CallbackRequest, VerificationCode};
use crate::events::{CbEvent, EventBus};
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::state::{StateError, StateManager};

/// Delivery channel for codes
pub const DEFAULT_CHANNEL: &str = "sms";

/// Verification failures surfaced to the caller
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("Request not found: {0}")]
    NotFound(String),
    #[error("Request {0} is not awaiting verification")]
    NotAwaitingVerification(String),
    #[error("No active code; request one first")]
    NoCode,
    #[error("Code expired; request a new one")]
    Expired,
    #[error("Too many attempts")]
    TooManyAttempts,
    #[error("Incorrect code")]
    Mismatch,
    #[error("State error: {0}")]
    State(String),
}

impl From<StateError> for VerifyError {
    fn from(error: StateError) -> Self {
        match error {
            StateError::NotFound(what) => VerifyError::NotFound(what),
            other => VerifyError::State(other.to_string()),
        }
    }
}

/// Issues and checks verification codes
pub struct Verifier {
    state: StateManager,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    notifier: Arc<Notifier>,
    code_length: u32,
    expiry_mins: u32,
    max_attempts: u32,
    commit_mode: CommitMode,
}

impl Verifier {
    pub fn new(
        state: StateManager,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        notifier: Arc<Notifier>,
        config: &VerificationConfig,
    ) -> Self {
        Self {
            state,
            bus,
            metrics,
            notifier,
            code_length: config.code_length,
            expiry_mins: config.expiry_mins,
            max_attempts: config.max_attempts,
            commit_mode: config.commit_mode,
        }
    }

    /// Issue a code for a request and text it to the visitor
    ///
    /// Reuses the existing usable code for the channel when one is live,
    /// so at most one valid code is in flight per (request, channel).
    pub async fn issue(&self, request_id: &str, channel: &str) -> Result<VerificationCode, VerifyError> {
        let request = self.state.get_request_required(request_id).await?;
        if request.status != CallStatus::Pending {
            return Err(VerifyError::NotAwaitingVerification(request_id.to_string()));
        }

        let now = now_ms();
        let code = match self.state.get_active_code(request_id, channel).await? {
            Some(existing) if existing.is_usable(now) => {
                debug!(request_id, channel, "issue: reusing live code");
                existing
            }
            _ => {
                let expires_at = now + i64::from(self.expiry_mins) * 60 * 1000;
                let code = VerificationCode::new(
                    request_id,
                    channel,
                    &request.phone,
                    generate_code(self.code_length),
                    expires_at,
                );
                self.state.create_code(code.clone()).await?;
                code
            }
        };

        self.notifier
            .verification_code(&request, &code.code, self.expiry_mins)
            .await;
        self.bus.emit(CbEvent::CodeIssued {
            request_id: request_id.to_string(),
            channel: channel.to_string(),
        });
        info!(request_id, channel, expires_at = code.expires_at, "Verification code issued");

        Ok(code)
    }

    /// Check a submitted code against the live code for the channel
    pub async fn check(
        &self,
        request_id: &str,
        channel: &str,
        submitted: &str,
    ) -> Result<(), VerifyError> {
        let Some(mut code) = self.state.get_active_code(request_id, channel).await? else {
            return Err(self.rejected(request_id, channel, VerifyError::NoCode));
        };

        let now = now_ms();
        if code.is_expired(now) {
            return Err(self.rejected(request_id, channel, VerifyError::Expired));
        }
        if code.attempts_exhausted(self.max_attempts) {
            return Err(self.rejected(request_id, channel, VerifyError::TooManyAttempts));
        }

        // The attempt is burned whether or not the code matches
        code.record_attempt();

        if code.code != submitted {
            self.state.update_code(code).await?;
            return Err(self.rejected(request_id, channel, VerifyError::Mismatch));
        }

        code.mark_verified();
        self.commit(request_id, code).await?;

        self.bus.emit(CbEvent::CodeVerified {
            request_id: request_id.to_string(),
            channel: channel.to_string(),
        });
        info!(request_id, channel, "Contact verified");
        Ok(())
    }

    /// Apply the verified-flag write and the status transition in the
    /// order the commit mode dictates
    async fn commit(&self, request_id: &str, code: VerificationCode) -> Result<(), VerifyError> {
        let mode = self.commit_mode.to_string();
        match self.commit_mode {
            CommitMode::OnCommit => {
                self.write_code(&mode, code).await?;
                self.advance_status(&mode, request_id).await?;
            }
            CommitMode::Immediate => {
                self.advance_status(&mode, request_id).await?;
                self.write_code(&mode, code).await?;
            }
            CommitMode::Deferred => {
                self.write_code(&mode, code).await?;
                let state = self.state.clone();
                let metrics = Arc::clone(&self.metrics);
                let request_id = request_id.to_string();
                tokio::spawn(async move {
                    if let Err(error) =
                        advance_status_with(&state, &metrics, &mode, &request_id).await
                    {
                        warn!(%request_id, %error, "Deferred status transition failed");
                    }
                });
            }
        }
        Ok(())
    }

    async fn write_code(&self, mode: &str, code: VerificationCode) -> Result<(), VerifyError> {
        self.state.update_code(code).await?;
        self.metrics.record_commit(mode, "mark-verified");
        Ok(())
    }

    async fn advance_status(&self, mode: &str, request_id: &str) -> Result<(), VerifyError> {
        advance_status_with(&self.state, &self.metrics, mode, request_id).await
    }

    fn rejected(&self, request_id: &str, channel: &str, error: VerifyError) -> VerifyError {
        warn!(request_id, channel, %error, "Verification check rejected");
        self.bus.emit(CbEvent::CodeRejected {
            request_id: request_id.to_string(),
            channel: channel.to_string(),
            reason: error.to_string(),
        });
        error
    }
}

/// Transition the request to Verified, tolerating an already-verified row
async fn advance_status_with(
    state: &StateManager,
    metrics: &Metrics,
    mode: &str,
    request_id: &str,
) -> Result<(), VerifyError> {
    let result = state
        .transition(
            request_id,
            CallStatus::Verified,
            "Contact verified",
            None,
            None,
            Some(vec![CallStatus::Pending]),
        )
        .await;

    match result {
        Ok(_) => {
            metrics.record_commit(mode, "advance-status");
            Ok(())
        }
        Err(StateError::InvalidTransition { .. }) => {
            let current = state.get_request_required(request_id).await?;
            if current.status == CallStatus::Verified {
                debug!(request_id, "advance_status: already verified");
                Ok(())
            } else {
                Err(VerifyError::State(format!(
                    "Request {request_id} moved to {} before verification landed",
                    current.status
                )))
            }
        }
        Err(other) => Err(other.into()),
    }
}

/// Zero-padded numeric code from the thread-local CSPRNG
fn generate_code(length: u32) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::create_event_bus;
    use crate::provider::gateway::mock::MockProvider;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        verifier: Verifier,
        state: StateManager,
        provider: Arc<MockProvider>,
        metrics: Arc<Metrics>,
        _dir: TempDir,
    }

    async fn fixture(commit_mode: CommitMode) -> Fixture {
        let dir = TempDir::new().unwrap();
        let bus = create_event_bus();
        let state = StateManager::spawn(dir.path().join("store.db"), Arc::clone(&bus)).unwrap();
        let provider = Arc::new(MockProvider::new());
        let metrics = Arc::new(Metrics::new());

        let mut config = Config::default();
        config.provider.service_number = "+15550009999".to_string();
        config.notify.business_phone = "+15550008888".to_string();
        config.verification.commit_mode = commit_mode;

        let notifier = Arc::new(Notifier::new(
            provider.clone() as Arc<dyn crate::provider::Provider>,
            Arc::clone(&bus),
            &config,
        ));
        let verifier = Verifier::new(
            state.clone(),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            notifier,
            &config.verification,
        );

        Fixture {
            verifier,
            state,
            provider,
            metrics,
            _dir: dir,
        }
    }

    async fn seeded_request(state: &StateManager) -> String {
        let request = CallbackRequest::with_id("req-1", "+13217047403");
        state.create_request(request).await.unwrap();
        "req-1".to_string()
    }

    #[test]
    fn test_generated_codes_are_zero_padded_digits() {
        for _ in 0..50 {
            let code = generate_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        assert_eq!(generate_code(4).len(), 4);
    }

    #[tokio::test]
    async fn test_issue_then_check_verifies_the_request() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;

        let issued = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();
        assert_eq!(issued.code.len(), 6);

        let sent = f.provider.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+13217047403");
        assert!(sent[0].1.contains(&issued.code));

        f.verifier.check(&id, DEFAULT_CHANNEL, &issued.code).await.unwrap();

        let request = f.state.get_request_required(&id).await.unwrap();
        assert_eq!(request.status, CallStatus::Verified);
        assert_eq!(request.status_message, "Contact verified");

        // The accepted code is no longer active
        assert!(f.state.get_active_code(&id, DEFAULT_CHANNEL).await.unwrap().is_none());

        let snapshot = f.metrics.snapshot_json();
        assert_eq!(snapshot["commits"]["on-commit/mark-verified"], 1);
        assert_eq!(snapshot["commits"]["on-commit/advance-status"], 1);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_reuses_live_code() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;

        let first = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();
        let second = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.code, second.code);

        // Both issues sent the text
        let sent = f.provider.sent_messages();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains(&first.code));
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_replaces_expired_code() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;

        let expired = VerificationCode::new(&id, DEFAULT_CHANNEL, "+13217047403", "111111", now_ms() - 1);
        f.state.create_code(expired.clone()).await.unwrap();

        let fresh = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();
        assert_ne!(fresh.id, expired.id);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_requires_pending_status() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;
        f.state
            .transition(&id, CallStatus::Verified, "Contact verified", None, None, None)
            .await
            .unwrap();

        let error = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap_err();
        assert_eq!(error, VerifyError::NotAwaitingVerification(id));
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_without_code() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;

        let error = f.verifier.check(&id, DEFAULT_CHANNEL, "123456").await.unwrap_err();
        assert_eq!(error, VerifyError::NoCode);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_expired_code() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;

        let expired = VerificationCode::new(&id, DEFAULT_CHANNEL, "+13217047403", "111111", now_ms() - 1);
        f.state.create_code(expired).await.unwrap();

        let error = f.verifier.check(&id, DEFAULT_CHANNEL, "111111").await.unwrap_err();
        assert_eq!(error, VerifyError::Expired);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_burns_attempts_then_locks_out() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;
        let issued = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();
        let wrong = if issued.code == "000000" { "000001" } else { "000000" };

        for expected_attempts in 1..=3u32 {
            let error = f.verifier.check(&id, DEFAULT_CHANNEL, wrong).await.unwrap_err();
            assert_eq!(error, VerifyError::Mismatch);
            let live = f.state.get_active_code(&id, DEFAULT_CHANNEL).await.unwrap().unwrap();
            assert_eq!(live.attempts, expected_attempts);
        }

        // Budget spent: even the correct code is refused now
        let error = f.verifier.check(&id, DEFAULT_CHANNEL, &issued.code).await.unwrap_err();
        assert_eq!(error, VerifyError::TooManyAttempts);

        let request = f.state.get_request_required(&id).await.unwrap();
        assert_eq!(request.status, CallStatus::Pending);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_immediate_mode_commits_both_writes() {
        let f = fixture(CommitMode::Immediate).await;
        let id = seeded_request(&f.state).await;
        let issued = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();

        f.verifier.check(&id, DEFAULT_CHANNEL, &issued.code).await.unwrap();

        let request = f.state.get_request_required(&id).await.unwrap();
        assert_eq!(request.status, CallStatus::Verified);

        let snapshot = f.metrics.snapshot_json();
        assert_eq!(snapshot["commits"]["immediate/advance-status"], 1);
        assert_eq!(snapshot["commits"]["immediate/mark-verified"], 1);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_mode_transitions_after_reply() {
        let f = fixture(CommitMode::Deferred).await;
        let id = seeded_request(&f.state).await;
        let issued = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();

        f.verifier.check(&id, DEFAULT_CHANNEL, &issued.code).await.unwrap();

        // The code write is durable before the reply
        assert!(f.state.get_active_code(&id, DEFAULT_CHANNEL).await.unwrap().is_none());

        // The transition lands from the follow-up task
        let mut verified = false;
        for _ in 0..100 {
            let request = f.state.get_request_required(&id).await.unwrap();
            if request.status == CallStatus::Verified {
                verified = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(verified, "deferred transition never landed");

        let snapshot = f.metrics.snapshot_json();
        assert_eq!(snapshot["commits"]["deferred/mark-verified"], 1);
        assert_eq!(snapshot["commits"]["deferred/advance-status"], 1);
        f.state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_tolerates_already_verified_request() {
        let f = fixture(CommitMode::OnCommit).await;
        let id = seeded_request(&f.state).await;
        let issued = f.verifier.issue(&id, DEFAULT_CHANNEL).await.unwrap();

        // Another path verified the request while the code was in flight
        f.state
            .transition(&id, CallStatus::Verified, "Contact verified", None, None, None)
            .await
            .unwrap();

        f.verifier.check(&id, DEFAULT_CHANNEL, &issued.code).await.unwrap();

        let request = f.state.get_request_required(&id).await.unwrap();
        assert_eq!(request.status, CallStatus::Verified);
        f.state.shutdown().await.unwrap();
    }
}
