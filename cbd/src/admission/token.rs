//! Human-verification token checks
//!
//! Posts the submitted token to a siteverify-style endpoint and reads
//! back the verdict. This gate fails CLOSED: a missing token, a network
//! error or a non-success verdict all reject the submission.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::HumanCheckConfig;

/// Checks submissions against the configured verifier endpoint
pub struct TokenVerifier {
    enabled: bool,
    url: String,
    secret: String,
    http: reqwest::Client,
}

/// Verdict payload from the verifier endpoint
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl TokenVerifier {
    /// Build a verifier from config, resolving the shared secret from env
    pub fn from_config(config: &HumanCheckConfig) -> eyre::Result<Self> {
        let secret = if config.enabled {
            std::env::var(&config.secret_env).map_err(|_| {
                eyre::eyre!("Human-check secret env var {} not set", config.secret_env)
            })?
        } else {
            String::new()
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            enabled: config.enabled,
            url: config.url.clone(),
            secret,
            http,
        })
    }

    /// Whether token checking is turned on
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Check a submission token; `true` means the submitter passed
    pub async fn verify(&self, token: Option<&str>, remote_addr: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            warn!(remote_addr, "Human-check token missing");
            return false;
        };

        let form = [
            ("secret", self.secret.as_str()),
            ("response", token),
            ("remoteip", remote_addr),
        ];

        let response = match self.http.post(&self.url).form(&form).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "Human-check request failed; rejecting");
                return false;
            }
        };

        let verdict: VerifyResponse = match response.json().await {
            Ok(verdict) => verdict,
            Err(error) => {
                warn!(%error, "Human-check verdict unreadable; rejecting");
                return false;
            }
        };

        if verdict.success {
            debug!(remote_addr, "Human-check passed");
        } else {
            warn!(remote_addr, error_codes = ?verdict.error_codes, "Human-check rejected token");
        }
        verdict.success
    }
}
