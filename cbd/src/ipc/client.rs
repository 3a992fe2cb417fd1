//! IPC client for communicating with the daemon
//!
//! Provides a simple interface for the CLI to send commands to the
//! daemon via Unix Domain Socket.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::messages::{DaemonMessage, DaemonResponse, StatusReport};
use crate::admission::Submission;
use crate::config::StorageConfig;
use crate::domain::{CallStatus, CallbackRequest};
use crate::events::AuditRecord;

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum outbound message size
const MAX_MESSAGE_SIZE: usize = 4096;

/// Maximum inbound response size; listings and metrics snapshots can
/// run long
const MAX_RESPONSE_SIZE: usize = 256 * 1024;

/// Client for communicating with the daemon via IPC
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Create a new client against the default runtime directory
    pub fn new() -> Self {
        Self::from_config(&StorageConfig::default())
    }

    /// Create a client for the configured runtime directory
    pub fn from_config(storage: &StorageConfig) -> Self {
        Self {
            socket_path: super::socket_path(&storage.runtime_dir),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a client with a custom socket path (for testing)
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        let response = self.send_message(DaemonMessage::Ping).await?;
        match response {
            DaemonResponse::Pong { version } => Ok(version),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        let response = self.send_message(DaemonMessage::Shutdown).await?;
        match response {
            DaemonResponse::Ok => Ok(()),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Submit a callback request through the admission chain
    pub async fn submit(&self, submission: &Submission) -> Result<CallbackRequest> {
        debug!(phone = %submission.phone, "DaemonClient: submitting request");
        let msg = DaemonMessage::Submit {
            submission: submission.clone(),
        };
        into_request(self.send_message(msg).await?)
    }

    /// Ask the daemon to issue a verification code
    ///
    /// Returns the delivery channel and expiry; the code itself only
    /// travels over the notification channel.
    pub async fn request_code(&self, id: &str) -> Result<(String, i64)> {
        debug!(%id, "DaemonClient: requesting verification code");
        let msg = DaemonMessage::RequestCode { id: id.to_string() };
        match self.send_message(msg).await? {
            DaemonResponse::CodeIssued {
                channel, expires_at, ..
            } => Ok((channel, expires_at)),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Check a verification code
    pub async fn verify(&self, id: &str, code: &str) -> Result<CallbackRequest> {
        debug!(%id, "DaemonClient: verifying code");
        let msg = DaemonMessage::Verify {
            id: id.to_string(),
            code: code.to_string(),
        };
        into_request(self.send_message(msg).await?)
    }

    /// Dispatch the call for a verified request
    pub async fn initiate(&self, id: &str) -> Result<CallbackRequest> {
        debug!(%id, "DaemonClient: initiating call");
        let msg = DaemonMessage::Initiate { id: id.to_string() };
        into_request(self.send_message(msg).await?)
    }

    /// Cancel a request
    pub async fn cancel(&self, id: &str) -> Result<CallbackRequest> {
        debug!(%id, "DaemonClient: cancelling request");
        let msg = DaemonMessage::Cancel { id: id.to_string() };
        into_request(self.send_message(msg).await?)
    }

    /// Report a provider call outcome
    pub async fn outcome(&self, id: &str, status: &str, duration_secs: u32) -> Result<CallbackRequest> {
        debug!(%id, status, "DaemonClient: reporting outcome");
        let msg = DaemonMessage::Outcome {
            id: id.to_string(),
            status: status.to_string(),
            duration_secs,
        };
        into_request(self.send_message(msg).await?)
    }

    /// Fetch one request and its audit trail
    pub async fn show(&self, id: &str) -> Result<(CallbackRequest, Vec<AuditRecord>)> {
        debug!(%id, "DaemonClient: fetching request");
        let msg = DaemonMessage::Show { id: id.to_string() };
        match self.send_message(msg).await? {
            DaemonResponse::Inspection { request, trail } => Ok((request, trail)),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// List requests, optionally filtered by status
    pub async fn list(&self, status: Option<CallStatus>) -> Result<Vec<CallbackRequest>> {
        debug!(?status, "DaemonClient: listing requests");
        let response = self.send_message(DaemonMessage::List { status }).await?;
        match response {
            DaemonResponse::Requests { requests } => Ok(requests),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Fetch the daemon status report
    pub async fn status(&self) -> Result<StatusReport> {
        debug!("DaemonClient: fetching status");
        let response = self.send_message(DaemonMessage::Status).await?;
        match response {
            DaemonResponse::Status { report } => Ok(report),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Fetch the metrics snapshot
    pub async fn metrics(&self) -> Result<serde_json::Value> {
        debug!("DaemonClient: fetching metrics");
        let response = self.send_message(DaemonMessage::Metrics).await?;
        match response {
            DaemonResponse::Metrics { snapshot } => Ok(snapshot),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Send a message to the daemon and wait for response
    async fn send_message(&self, msg: DaemonMessage) -> Result<DaemonResponse> {
        debug!(?self.socket_path, ?msg, "DaemonClient: sending message");

        // Connect with timeout
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")?;

        self.send_on_stream(stream, msg).await
    }

    /// Send message on an existing stream (extracted for testing)
    async fn send_on_stream(&self, mut stream: UnixStream, msg: DaemonMessage) -> Result<DaemonResponse> {
        // Serialize message
        let msg_json = serde_json::to_string(&msg).context("Failed to serialize message")?;

        // Validate message size
        if msg_json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", msg_json.len()));
        }

        // Send message with newline
        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(msg_json.as_bytes())
                .await
                .context("Failed to write message")?;
            stream.write_all(b"\n").await.context("Failed to write newline")?;
            stream.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;

        // Read response with size limit
        let mut reader = BufReader::new(&mut stream);
        let mut response_line = String::new();

        tokio::time::timeout(self.timeout, async {
            let bytes_read = reader
                .read_line(&mut response_line)
                .await
                .context("Failed to read response")?;

            if bytes_read > MAX_RESPONSE_SIZE {
                return Err(eyre::eyre!("Response too large: {} bytes", bytes_read));
            }

            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Read timeout")??;

        // Parse response
        let response: DaemonResponse =
            serde_json::from_str(response_line.trim()).context("Failed to parse daemon response")?;

        debug!(?response, "DaemonClient: received response");
        Ok(response)
    }
}

fn into_request(response: DaemonResponse) -> Result<CallbackRequest> {
    match response {
        DaemonResponse::Request { request } => Ok(request),
        DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
        _ => Err(eyre::eyre!("Unexpected response")),
    }
}
