//! Hosted REST provider
//!
//! Twilio-style API: form-encoded POSTs to per-account Calls/Messages
//! resources with basic auth. Transient failures are retried with bounded
//! exponential backoff before the error is handed to the caller.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HostedConfig;

use super::{DispatchReceipt, Provider, ProviderError};

/// Maximum number of retries for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Ceiling on any single backoff sleep
const MAX_BACKOFF_MS: u64 = 5000;

/// TwiML played to the answering party while the legs are bridged
const HOLD_MUSIC_URL: &str = "http://twimlets.com/holdmusic?Bucket=com.twilio.music.classical";

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Hosted REST provider client
pub struct HostedProvider {
    base_url: String,
    account_sid: String,
    auth_token: String,
    call_timeout_secs: u32,
    status_callback_url: Option<String>,
    http: Client,
}

impl HostedProvider {
    /// Create a new client from configuration
    ///
    /// Reads credentials from the environment variables the config names.
    pub fn from_config(config: &HostedConfig) -> Result<Self, ProviderError> {
        debug!(base_url = %config.base_url, "from_config: called");
        let (account_sid, auth_token) = config
            .credentials()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            base_url: config.base_url.clone(),
            account_sid,
            auth_token,
            call_timeout_secs: config.call_timeout_secs,
            status_callback_url: config.status_callback_url.clone(),
            http,
        })
    }

    /// Build the form body for a call placement
    fn call_form(&self, destination: &str, caller_id: &str, request_id: &str) -> Vec<(&'static str, String)> {
        debug!(%destination, %request_id, "call_form: called");
        let mut form = vec![
            ("To", destination.to_string()),
            ("From", caller_id.to_string()),
            ("Url", HOLD_MUSIC_URL.to_string()),
            ("Timeout", self.call_timeout_secs.to_string()),
        ];

        if let Some(callback) = &self.status_callback_url {
            let sep = if callback.contains('?') { '&' } else { '?' };
            form.push(("StatusCallback", format!("{}{}request_id={}", callback, sep, request_id)));
            for event in ["completed", "no-answer", "busy", "failed"] {
                form.push(("StatusCallbackEvent", event.to_string()));
            }
        }

        form
    }

    /// Build the form body for a message send
    fn message_form(&self, destination: &str, sender: &str, body: &str) -> Vec<(&'static str, String)> {
        vec![
            ("To", destination.to_string()),
            ("From", sender.to_string()),
            ("Body", body.to_string()),
        ]
    }

    /// POST a form with bounded retries for transient failures
    async fn post_form(&self, url: &str, form: &[(&'static str, String)]) -> Result<DispatchReceipt, ProviderError> {
        let mut last_error = None;
        let mut override_backoff: Option<Duration> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = override_backoff.take().unwrap_or_else(|| {
                    Duration::from_millis((INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1)).min(MAX_BACKOFF_MS))
                });
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "post_form: retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
            }

            let response = match self
                .http
                .post(url)
                .basic_auth(&self.account_sid, Some(&self.auth_token))
                .form(&form)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    debug!(attempt, error = %e, "post_form: network error");
                    last_error = Some(ProviderError::Network(e));
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = parse_retry_after(&response);
                debug!(attempt, ?retry_after, "post_form: rate limited (429)");
                // Honor Retry-After only when it fits under the backoff cap
                if let Some(d) = retry_after
                    && d <= Duration::from_millis(MAX_BACKOFF_MS)
                {
                    override_backoff = Some(d);
                }
                last_error = Some(ProviderError::RateLimited {
                    retry_after: retry_after.unwrap_or(Duration::from_secs(60)),
                });
                continue;
            }

            if is_retryable_status(status) && attempt < MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                debug!(attempt, status, "post_form: retryable error");
                last_error = Some(ProviderError::ApiError { status, message: text });
                continue;
            }

            if !response.status().is_success() {
                debug!(%status, "post_form: permanent rejection");
                let text = response.text().await.unwrap_or_default();
                return Err(ProviderError::ApiError { status, message: text });
            }

            debug!("post_form: success");
            let api_response: ApiResponse = response.json().await?;
            return Ok(DispatchReceipt {
                reference: api_response.sid,
                status: api_response.status.unwrap_or_else(|| "queued".to_string()),
            });
        }

        Err(last_error.unwrap_or_else(|| ProviderError::Protocol("Max retries exceeded".to_string())))
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Provider for HostedProvider {
    async fn place_call(
        &self,
        destination: &str,
        caller_id: &str,
        request_id: &str,
    ) -> Result<DispatchReceipt, ProviderError> {
        debug!(%destination, %request_id, "place_call: called");
        let url = format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid);
        let form = self.call_form(destination, caller_id, request_id);
        self.post_form(&url, &form).await
    }

    async fn send_message(
        &self,
        destination: &str,
        sender: &str,
        body: &str,
    ) -> Result<DispatchReceipt, ProviderError> {
        debug!(%destination, "send_message: called");
        let url = format!("{}/Accounts/{}/Messages.json", self.base_url, self.account_sid);
        let form = self.message_form(destination, sender, body);
        self.post_form(&url, &form).await
    }

    async fn is_ready(&self) -> bool {
        let url = format!("{}/Accounts/{}.json", self.base_url, self.account_sid);
        match self
            .http
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                debug!(error = %e, "is_ready: probe failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "hosted"
    }
}

// API response shape

#[derive(Debug, Deserialize)]
struct ApiResponse {
    sid: String,
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider(callback: Option<&str>) -> HostedProvider {
        HostedProvider {
            base_url: "https://api.example.com/2010-04-01".to_string(),
            account_sid: "AC-test".to_string(),
            auth_token: "token".to_string(),
            call_timeout_secs: 20,
            status_callback_url: callback.map(String::from),
            http: Client::new(),
        }
    }

    #[test]
    fn test_call_form_basic() {
        let provider = test_provider(None);
        let form = provider.call_form("+15550001111", "+15550002222", "req-1");

        assert!(form.contains(&("To", "+15550001111".to_string())));
        assert!(form.contains(&("From", "+15550002222".to_string())));
        assert!(form.contains(&("Timeout", "20".to_string())));
        assert!(!form.iter().any(|(k, _)| *k == "StatusCallback"));
    }

    #[test]
    fn test_call_form_with_status_callback() {
        let provider = test_provider(Some("https://cbd.example.com/status"));
        let form = provider.call_form("+15550001111", "+15550002222", "req-1");

        let callback = form.iter().find(|(k, _)| *k == "StatusCallback").unwrap();
        assert_eq!(callback.1, "https://cbd.example.com/status?request_id=req-1");

        let events: Vec<&str> = form
            .iter()
            .filter(|(k, _)| *k == "StatusCallbackEvent")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(events, vec!["completed", "no-answer", "busy", "failed"]);
    }

    #[test]
    fn test_call_form_callback_with_existing_query() {
        let provider = test_provider(Some("https://cbd.example.com/status?src=hosted"));
        let form = provider.call_form("+15550001111", "+15550002222", "req-1");

        let callback = form.iter().find(|(k, _)| *k == "StatusCallback").unwrap();
        assert_eq!(callback.1, "https://cbd.example.com/status?src=hosted&request_id=req-1");
    }

    #[test]
    fn test_message_form() {
        let provider = test_provider(None);
        let form = provider.message_form("+15550001111", "+15550002222", "Your code is 042117");

        assert_eq!(
            form,
            vec![
                ("To", "+15550001111".to_string()),
                ("From", "+15550002222".to_string()),
                ("Body", "Your code is 042117".to_string()),
            ]
        );
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{} should be retryable", status);
        }
        for status in [200, 201, 400, 401, 404, 422] {
            assert!(!is_retryable_status(status), "{} should not be retryable", status);
        }
    }
}
