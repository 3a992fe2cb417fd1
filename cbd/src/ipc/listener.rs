//! IPC listener for the daemon side
//!
//! Socket plumbing plus the command dispatch that turns a parsed
//! [`DaemonMessage`] into a [`DaemonResponse`]. Every mutating command
//! goes through the lifecycle engine; errors come back as
//! `DaemonResponse::Error` rather than dropping the connection.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::messages::{DaemonMessage, DaemonResponse, StatusReport};
use crate::daemon::VERSION;
use crate::lifecycle::Engine;
use crate::metrics::Metrics;
use crate::state::StateManager;

/// Maximum inbound message size; a full submission fits with room to spare
const MAX_MESSAGE_SIZE: usize = 4096;

/// Create a listener at a specific path
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener_at(socket_path: &PathBuf) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: creating IPC socket");

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    // Clean up stale socket if exists
    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    // Bind the socket
    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener_at: socket bound successfully");

    Ok((listener, socket_path.clone()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &PathBuf) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Read one command off the stream
pub async fn read_message(stream: &mut UnixStream) -> Result<DaemonMessage> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    // Read with size limit
    let bytes_read = reader
        .read_line(&mut line)
        .await
        .context("Failed to read IPC message")?;

    if bytes_read > MAX_MESSAGE_SIZE {
        return Err(eyre::eyre!("Message too large: {} bytes", bytes_read));
    }

    if line.is_empty() {
        return Err(eyre::eyre!("Empty message received"));
    }

    let msg: DaemonMessage = serde_json::from_str(line.trim()).context("Failed to parse IPC message")?;
    debug!(?msg, "read_message: parsed message");

    Ok(msg)
}

/// Send a response on the stream
pub async fn send_response(stream: &mut UnixStream, response: DaemonResponse) -> Result<()> {
    let response_json = serde_json::to_string(&response).context("Failed to serialize response")?;
    stream
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write response")?;
    stream.write_all(b"\n").await.context("Failed to write newline")?;
    stream.flush().await.context("Failed to flush response")?;
    debug!(?response, "send_response: sent response");
    Ok(())
}

/// Accept loop for the daemon socket
///
/// Connections are served one at a time; commands are short and the
/// CLI is the only client. The shutdown response is written before the
/// loop observes its own broadcast and returns.
pub async fn run_listener(
    listener: UnixListener,
    engine: Arc<Engine>,
    state: StateManager,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let mut shutdown = shutdown_tx.subscribe();
    info!("IPC listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, _addr)) => {
                        if let Err(e) =
                            serve_connection(&mut stream, &engine, &state, &metrics, &shutdown_tx).await
                        {
                            warn!(error = %e, "IPC connection failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
                }
            }
            _ = shutdown.recv() => {
                info!("IPC listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(
    stream: &mut UnixStream,
    engine: &Engine,
    state: &StateManager,
    metrics: &Metrics,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let msg = read_message(stream).await?;
    let response = handle_message(msg, engine, state, metrics, shutdown_tx).await;
    send_response(stream, response).await
}

/// Dispatch one command against the daemon's services
pub async fn handle_message(
    msg: DaemonMessage,
    engine: &Engine,
    state: &StateManager,
    metrics: &Metrics,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    match msg {
        DaemonMessage::Ping => {
            debug!("handle_message: Ping");
            DaemonResponse::Pong {
                version: VERSION.to_string(),
            }
        }
        DaemonMessage::Shutdown => {
            info!("Shutdown requested over IPC");
            let _ = shutdown_tx.send(());
            DaemonResponse::Ok
        }
        DaemonMessage::Submit { submission } => match engine.submit(&submission).await {
            Ok(request) => DaemonResponse::Request { request },
            Err(e) => failure(e),
        },
        DaemonMessage::RequestCode { id } => match engine.request_code(&id).await {
            Ok(code) => DaemonResponse::CodeIssued {
                request_id: code.request_id,
                channel: code.channel,
                expires_at: code.expires_at,
            },
            Err(e) => failure(e),
        },
        DaemonMessage::Verify { id, code } => match engine.verify(&id, &code).await {
            Ok(request) => DaemonResponse::Request { request },
            Err(e) => failure(e),
        },
        DaemonMessage::Initiate { id } => match engine.dispatch(&id).await {
            Ok(request) => DaemonResponse::Request { request },
            Err(e) => failure(e),
        },
        DaemonMessage::Cancel { id } => match engine.cancel(&id).await {
            Ok(request) => DaemonResponse::Request { request },
            Err(e) => failure(e),
        },
        DaemonMessage::Outcome {
            id,
            status,
            duration_secs,
        } => match engine.record_outcome(&id, &status, duration_secs).await {
            Ok(request) => DaemonResponse::Request { request },
            Err(e) => failure(e),
        },
        DaemonMessage::Show { id } => {
            let request = match state.get_request_required(&id).await {
                Ok(request) => request,
                Err(e) => return failure(e),
            };
            match state.list_audit(&id).await {
                Ok(trail) => DaemonResponse::Inspection { request, trail },
                Err(e) => failure(e),
            }
        }
        DaemonMessage::List { status } => match state.list_requests(status).await {
            Ok(requests) => DaemonResponse::Requests { requests },
            Err(e) => failure(e),
        },
        DaemonMessage::Status => {
            let counts = match state.status_counts().await {
                Ok(counts) => counts,
                Err(e) => return failure(e),
            };
            match state.priority_counts().await {
                Ok(priorities) => DaemonResponse::Status {
                    report: StatusReport {
                        version: VERSION.to_string(),
                        counts: counts
                            .into_iter()
                            .map(|(status, n)| (status.to_string(), n))
                            .collect(),
                        priorities: priorities
                            .into_iter()
                            .map(|(priority, n)| (priority.to_string(), n))
                            .collect(),
                        workers: metrics.workers(),
                    },
                },
                Err(e) => failure(e),
            }
        }
        DaemonMessage::Metrics => DaemonResponse::Metrics {
            snapshot: metrics.snapshot_json(),
        },
    }
}

fn failure(e: impl std::fmt::Display) -> DaemonResponse {
    DaemonResponse::Error {
        message: e.to_string(),
    }
}
