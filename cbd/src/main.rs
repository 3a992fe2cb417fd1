//! Callbackd - Callback Request Lifecycle Orchestrator
//!
//! CLI entry point for submitting requests and managing the daemon.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use colored::*;
use eyre::{Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use callbackd::admission::{AdmissionController, ConcurrencyGate, Submission, TokenVerifier};
use callbackd::cli::{Cli, Command, OutputFormat, generate_after_help, get_log_path};
use callbackd::config::Config;
use callbackd::daemon::{DaemonManager, VERSION};
use callbackd::domain::{CallStatus, CallbackRequest, Priority};
use callbackd::events::{AuditRecord, create_event_bus, spawn_audit_sink};
use callbackd::ipc::{self, DaemonClient, StatusReport};
use callbackd::lifecycle::Engine;
use callbackd::metrics::{Metrics, spawn_metrics_sink};
use callbackd::notify::Notifier;
use callbackd::provider::create_provider;
use callbackd::scheduler::escalation::{ESCALATION_WORKER, run_escalation_sweeper};
use callbackd::scheduler::retry::{RETRY_WORKER, run_retry_sweeper};
use callbackd::state::StateManager;
use callbackd::supervisor::supervise;
use callbackd::verify::Verifier;

fn setup_logging(verbose: bool, config: &Config) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = PathBuf::from(&config.storage.runtime_dir).join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::File::create(log_dir.join("cbd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Build command with dynamic after_help that shows daemon status
    let cmd = Cli::command().after_help(generate_after_help());

    // Parse CLI arguments using the modified command
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.verbose, &config).context("Failed to setup logging")?;

    info!("Callbackd loaded config: provider={}", config.provider.kind);

    // Dispatch command
    debug!("main: dispatching command");
    match cli.command {
        Some(Command::Start { foreground }) => {
            debug!(foreground, "main: matched Start command");
            cmd_start(&config, cli.config.clone(), foreground).await
        }
        Some(Command::Stop) => {
            debug!("main: matched Stop command");
            cmd_stop(&config).await
        }
        Some(Command::Status { format }) => {
            debug!(?format, "main: matched Status command");
            cmd_status(&config, format).await
        }
        Some(Command::Submit {
            phone,
            name,
            email,
            priority,
            token,
            website,
            remote_addr,
            agent,
        }) => {
            debug!(%phone, "main: matched Submit command");
            let priority = match priority.as_deref() {
                Some(s) => Some(s.parse::<Priority>().map_err(|e| eyre::eyre!(e))?),
                None => None,
            };
            let submission = Submission {
                phone,
                name,
                email,
                priority,
                website: website.unwrap_or_default(),
                token,
                remote_addr,
                agent,
            };
            cmd_submit(&config, &submission).await
        }
        Some(Command::RequestCode { id }) => {
            debug!(%id, "main: matched RequestCode command");
            cmd_request_code(&config, &id).await
        }
        Some(Command::Verify { id, code }) => {
            debug!(%id, "main: matched Verify command");
            cmd_verify(&config, &id, &code).await
        }
        Some(Command::Initiate { id }) => {
            debug!(%id, "main: matched Initiate command");
            cmd_initiate(&config, &id).await
        }
        Some(Command::Cancel { id }) => {
            debug!(%id, "main: matched Cancel command");
            cmd_cancel(&config, &id).await
        }
        Some(Command::Show { id, format }) => {
            debug!(%id, ?format, "main: matched Show command");
            cmd_show(&config, &id, format).await
        }
        Some(Command::List { status, format }) => {
            debug!(?status, ?format, "main: matched List command");
            let status = match status.as_deref() {
                Some(s) => Some(s.parse::<CallStatus>().map_err(|e| eyre::eyre!(e))?),
                None => None,
            };
            cmd_list(&config, status, format).await
        }
        Some(Command::Metrics { format }) => {
            debug!(?format, "main: matched Metrics command");
            cmd_metrics(&config, format).await
        }
        Some(Command::Logs { follow, lines }) => {
            debug!(follow, lines, "main: matched Logs command");
            cmd_logs(&config, follow, lines).await
        }
        Some(Command::RunDaemon) => {
            debug!("main: matched RunDaemon command");
            cmd_run_daemon(&config).await
        }
        Some(Command::Outcome {
            id,
            status,
            duration_secs,
        }) => {
            debug!(%id, %status, duration_secs, "main: matched Outcome command");
            cmd_outcome(&config, &id, &status, duration_secs).await
        }
        None => {
            debug!("main: no command specified, showing status");
            cmd_status(&config, OutputFormat::Text).await
        }
    }
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<PathBuf>, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");

    // Fail fast on missing credentials before forking
    config.validate()?;

    let daemon = DaemonManager::from_config(&config.storage);

    if daemon.is_running() {
        debug!(pid = ?daemon.running_pid(), "cmd_start: daemon already running");
        if let Some(pid) = daemon.running_pid() {
            println!("Callbackd is already running (PID: {})", pid);
        } else {
            println!("Callbackd is already running");
        }
        return Ok(());
    }

    if foreground {
        debug!("cmd_start: starting in foreground mode");
        println!("Starting callbackd in foreground mode...");
        daemon.register_self()?;
        let result = run_daemon(config).await;
        let _ = daemon.unregister_self();
        result
    } else {
        debug!("cmd_start: starting in background mode");
        let pid = daemon.start(config_path.as_deref())?;
        println!("Callbackd started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
///
/// Tries IPC shutdown first for graceful stop, falls back to SIGTERM if IPC fails.
async fn cmd_stop(config: &Config) -> Result<()> {
    debug!("cmd_stop: called");
    let daemon = DaemonManager::from_config(&config.storage);

    if !daemon.is_running() {
        debug!("cmd_stop: daemon is not running");
        println!("Callbackd is not running");
        return Ok(());
    }

    let pid = daemon.running_pid();

    // Try graceful IPC shutdown first
    let client = DaemonClient::from_config(&config.storage);
    if client.socket_exists() {
        debug!("cmd_stop: trying IPC shutdown");
        match client.shutdown().await {
            Ok(()) => {
                debug!("cmd_stop: IPC shutdown acknowledged");
                // Wait for process to exit
                let mut attempts = 0;
                while daemon.is_running() && attempts < 50 {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    attempts += 1;
                }
                if !daemon.is_running() {
                    if let Some(pid) = pid {
                        println!("Callbackd stopped gracefully via IPC (was PID: {})", pid);
                    } else {
                        println!("Callbackd stopped gracefully via IPC");
                    }
                    return Ok(());
                }
                debug!("cmd_stop: IPC shutdown timed out, falling back to SIGTERM");
            }
            Err(e) => {
                debug!(error = %e, "cmd_stop: IPC shutdown failed, falling back to SIGTERM");
            }
        }
    }

    // Fall back to SIGTERM
    debug!("cmd_stop: using SIGTERM");
    daemon.stop()?;
    if let Some(pid) = pid {
        println!("Callbackd stopped (was PID: {})", pid);
    } else {
        println!("Callbackd stopped");
    }
    Ok(())
}

/// Show daemon liveness, request counts, and worker health
async fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let daemon = DaemonManager::from_config(&config.storage);
    let status = daemon.status();

    if !status.running {
        debug!("cmd_status: daemon is stopped");
        match format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "running": false,
                    "pid_file": status.pid_file.to_string_lossy(),
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            OutputFormat::Text | OutputFormat::Table => {
                println!("Callbackd Status");
                println!("----------------");
                println!("Status: stopped");
                println!("PID file: {}", status.pid_file.display());
            }
        }
        return Ok(());
    }

    let client = DaemonClient::from_config(&config.storage);
    let report = match client.status().await {
        Ok(report) => report,
        Err(e) => {
            debug!(error = %e, "cmd_status: IPC status failed");
            println!("Daemon PID file exists but not responding to IPC");
            println!("Error: {}", e);
            return Ok(());
        }
    };

    match format {
        OutputFormat::Json => {
            debug!("cmd_status: format is Json");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            debug!("cmd_status: format is Text or Table");
            print_status_report(&status.pid, &report);
        }
    }

    Ok(())
}

fn print_status_report(pid: &Option<u32>, report: &StatusReport) {
    println!("Callbackd Status");
    println!("----------------");
    println!("Status: running");
    if let Some(pid) = pid {
        println!("PID: {}", pid);
    }
    println!("Version: {}", report.version);

    println!();
    println!("Requests by status:");
    if report.counts.is_empty() {
        println!("  (none)");
    } else {
        for (status, n) in &report.counts {
            println!("  {:<16} {}", status, n);
        }
    }

    println!();
    println!("Requests by priority:");
    if report.priorities.is_empty() {
        println!("  (none)");
    } else {
        for (priority, n) in &report.priorities {
            println!("  {:<16} {}", priority, n);
        }
    }

    if !report.workers.is_empty() {
        println!();
        println!("Workers:");
        for worker in &report.workers {
            let age_ms = callstore::now_ms() - worker.last_beat_ms;
            let live = worker.last_beat_ms > 0 && age_ms < 120_000;
            let icon = if live { "\u{2705}" } else { "\u{274C}" };
            println!(
                "  {} {:<20} beats={} failures={} restarts={}",
                icon, worker.worker, worker.beats, worker.failures, worker.restarts
            );
        }
    }
}

/// Submit a callback request through the daemon
async fn cmd_submit(config: &Config, submission: &Submission) -> Result<()> {
    debug!(phone = %submission.phone, "cmd_submit: called");
    let client = require_daemon(config).await?;
    let request = client.submit(submission).await?;
    println!("Request {} accepted", request.id.cyan());
    println!("  Phone:    {}", request.phone);
    println!("  Status:   {}", request.status);
    println!("  Priority: {}", request.priority);
    println!();
    println!("Next: cbd request-code {}", request.id);
    Ok(())
}

/// Ask the daemon to issue a verification code
async fn cmd_request_code(config: &Config, id: &str) -> Result<()> {
    debug!(%id, "cmd_request_code: called");
    let client = require_daemon(config).await?;
    let (channel, expires_at) = client.request_code(id).await?;
    println!("Verification code sent via {} (expires {})", channel, format_ts(expires_at));
    println!();
    println!("Next: cbd verify {} <code>", id);
    Ok(())
}

/// Check a verification code
async fn cmd_verify(config: &Config, id: &str, code: &str) -> Result<()> {
    debug!(%id, "cmd_verify: called");
    let client = require_daemon(config).await?;
    let request = client.verify(id, code).await?;
    println!("Request {} verified (status: {})", request.id.cyan(), request.status);
    println!();
    println!("Next: cbd initiate {}", request.id);
    Ok(())
}

/// Dispatch the call for a verified request
async fn cmd_initiate(config: &Config, id: &str) -> Result<()> {
    debug!(%id, "cmd_initiate: called");
    let client = require_daemon(config).await?;
    let request = client.initiate(id).await?;
    println!("Request {}: {}", request.id.cyan(), request.status_message);
    println!("  Status: {}", request.status);
    if let Some(call_ref) = &request.call_ref {
        println!("  Call reference: {}", call_ref);
    }
    Ok(())
}

/// Cancel a request
async fn cmd_cancel(config: &Config, id: &str) -> Result<()> {
    debug!(%id, "cmd_cancel: called");
    let client = require_daemon(config).await?;
    let request = client.cancel(id).await?;
    println!("Request {} cancelled", request.id.cyan());
    Ok(())
}

/// Feed a provider call outcome into the daemon (hidden bridge command)
async fn cmd_outcome(config: &Config, id: &str, status: &str, duration_secs: u32) -> Result<()> {
    debug!(%id, %status, duration_secs, "cmd_outcome: called");
    let client = require_daemon(config).await?;
    let request = client.outcome(id, status, duration_secs).await?;
    println!("Request {}: {}", request.id.cyan(), request.status);
    Ok(())
}

/// Show one request with its audit trail
///
/// Routes over IPC when the daemon is up, otherwise reads the store
/// directly (read-only, so it coexists with a later daemon start).
async fn cmd_show(config: &Config, id: &str, format: OutputFormat) -> Result<()> {
    debug!(%id, ?format, "cmd_show: called");
    let client = DaemonClient::from_config(&config.storage);
    let (request, trail) = if client.socket_exists() {
        client.show(id).await?
    } else {
        debug!("cmd_show: daemon down, reading store directly");
        let store = open_store_read_only(config)?;
        let request: CallbackRequest = store
            .get(id)
            .map_err(|e| eyre::eyre!("Store read failed: {}", e))?
            .ok_or_else(|| eyre::eyre!("Request not found: {}", id))?;
        let filter = callstore::Filter {
            field: "request_id".to_string(),
            op: callstore::FilterOp::Eq,
            value: callstore::IndexValue::String(id.to_string()),
        };
        let mut trail: Vec<AuditRecord> = store
            .list(&[filter])
            .map_err(|e| eyre::eyre!("Store read failed: {}", e))?;
        trail.sort_by_key(|r| r.created_at);
        (request, trail)
    };

    match format {
        OutputFormat::Json => {
            debug!("cmd_show: format is Json");
            let json = serde_json::json!({ "request": request, "trail": trail });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            debug!("cmd_show: format is Text or Table");
            print_request(&request);
            if !trail.is_empty() {
                println!();
                println!("Audit trail:");
                for record in &trail {
                    print_audit_record(record);
                }
            }
        }
    }

    Ok(())
}

fn print_request(request: &CallbackRequest) {
    println!("{}", request.id.cyan());
    println!("  Phone:     {}", request.phone);
    if let Some(name) = &request.name {
        println!("  Name:      {}", name);
    }
    println!("  Status:    {} ({})", request.status, request.status_message);
    println!("  Priority:  {}", request.priority);
    println!("  Created:   {}", format_ts(request.created_at));
    println!("  Updated:   {}", format_ts(request.updated_at));
    if request.retry_count > 0 {
        println!("  Retries:   {} of {}", request.retry_count, request.max_retries);
    }
    if let Some(next_retry_at) = request.next_retry_at {
        println!("  Next retry: {}", format_ts(next_retry_at));
    }
    if request.escalation_level > 0 {
        println!(
            "  Escalated: level {} to {}",
            request.escalation_level,
            request.escalated_to.as_deref().unwrap_or("?")
        );
    }
    if let Some(call_ref) = &request.call_ref {
        println!("  Call ref:  {}", call_ref);
    }
}

fn print_audit_record(record: &AuditRecord) {
    let when = format_ts(record.created_at);
    println!("  {}  {}", when.dimmed(), record.event.kind());
}

/// List requests, over IPC or straight from the store when the daemon is down
async fn cmd_list(config: &Config, status: Option<CallStatus>, format: OutputFormat) -> Result<()> {
    debug!(?status, ?format, "cmd_list: called");
    let client = DaemonClient::from_config(&config.storage);
    let requests = if client.socket_exists() {
        client.list(status).await?
    } else {
        debug!("cmd_list: daemon down, reading store directly");
        let store = open_store_read_only(config)?;
        let mut filters = Vec::new();
        if let Some(status) = status {
            filters.push(callstore::Filter {
                field: "status".to_string(),
                op: callstore::FilterOp::Eq,
                value: callstore::IndexValue::String(status.to_string()),
            });
        }
        store
            .list::<CallbackRequest>(&filters)
            .map_err(|e| eyre::eyre!("Store read failed: {}", e))?
    };

    match format {
        OutputFormat::Json => {
            debug!("cmd_list: format is Json");
            println!("{}", serde_json::to_string_pretty(&requests)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            debug!(count = requests.len(), "cmd_list: format is Text or Table");
            if requests.is_empty() {
                println!(
                    "No requests found{}",
                    status.map(|s| format!(" with status '{}'", s)).unwrap_or_default()
                );
                return Ok(());
            }
            println!(
                "{:<28} {:<16} {:<16} {:<8} {:<20}",
                "ID", "PHONE", "STATUS", "PRIORITY", "UPDATED"
            );
            println!("{}", "-".repeat(92));
            for request in requests {
                println!(
                    "{:<28} {:<16} {:<16} {:<8} {:<20}",
                    request.id,
                    request.phone,
                    request.status.to_string(),
                    request.priority.to_string(),
                    format_ts(request.updated_at)
                );
            }
        }
    }

    Ok(())
}

/// Show metrics and statistics
async fn cmd_metrics(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_metrics: called");
    let client = require_daemon(config).await?;
    let snapshot = client.metrics().await?;

    match format {
        OutputFormat::Json => {
            debug!("cmd_metrics: outputting JSON");
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            debug!("cmd_metrics: outputting text/table");
            println!("Callbackd Metrics");
            println!("-----------------");
            if let Some(map) = snapshot.as_object() {
                for (key, value) in map {
                    match value {
                        serde_json::Value::Object(nested) => {
                            println!("{}:", key);
                            for (inner_key, inner_value) in nested {
                                println!("  {:<28} {}", inner_key, inner_value);
                            }
                        }
                        _ => println!("{:<30} {}", key, value),
                    }
                }
            } else {
                println!("{}", snapshot);
            }
        }
    }

    Ok(())
}

/// Show logs
async fn cmd_logs(config: &Config, follow: bool, lines: usize) -> Result<()> {
    debug!(follow, lines, "cmd_logs: called");
    let log_path = PathBuf::from(&config.storage.runtime_dir).join("logs").join("cbd.log");
    let log_path = if log_path.exists() { log_path } else { get_log_path() };

    if !log_path.exists() {
        debug!(?log_path, "cmd_logs: log file does not exist");
        println!("No log file found at: {}", log_path.display());
        println!("The daemon may not have been started yet.");
        return Ok(());
    }

    if follow {
        debug!(?log_path, "cmd_logs: following log file");
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();

        // Use tail -f for following
        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;

        child.wait()?;
    } else {
        debug!(?log_path, lines, "cmd_logs: reading last N lines");
        // Read last N lines
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let reader = BufReader::new(file);
        let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

        let start = if all_lines.len() > lines { all_lines.len() - lines } else { 0 };

        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }

    Ok(())
}

/// Run as the daemon process (internal command)
async fn cmd_run_daemon(config: &Config) -> Result<()> {
    debug!("cmd_run_daemon: called");
    let daemon = DaemonManager::from_config(&config.storage);
    daemon.register_self()?;
    debug!("cmd_run_daemon: daemon registered, starting run_daemon");

    let result = run_daemon(config).await;
    let _ = daemon.unregister_self();
    result
}

/// Open the store without taking the writer lock
///
/// Lets read-only commands work while the daemon holds the store, and
/// when the daemon is down.
fn open_store_read_only(config: &Config) -> Result<callstore::Store> {
    let store_path = PathBuf::from(&config.storage.store_path);
    if !store_path.exists() {
        return Err(eyre::eyre!(
            "No store at {}. Start the daemon first: cbd start",
            store_path.display()
        ));
    }
    callstore::Store::open_read_only(&store_path).context("Failed to open the store read-only")
}

/// Get a client and confirm the daemon answers, with a useful error when it doesn't
async fn require_daemon(config: &Config) -> Result<DaemonClient> {
    let client = DaemonClient::from_config(&config.storage);
    if !client.socket_exists() {
        return Err(eyre::eyre!("Callbackd is not running. Start it with: cbd start"));
    }
    Ok(client)
}

fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Run the daemon main loop
async fn run_daemon(config: &Config) -> Result<()> {
    debug!("run_daemon: called");
    info!("Daemon starting (version {})...", VERSION);

    // ============================================================
    // EARLY VALIDATION - Fail fast with clear error messages
    // ============================================================

    config.validate()?;
    debug!("run_daemon: credentials present");

    if config.provider.service_number.is_empty() {
        return Err(eyre::eyre!(
            "provider.service-number is not configured. Calls need an originating number."
        ));
    }

    info!("Startup validation passed");

    // ============================================================
    // INITIALIZATION
    // ============================================================

    let store_path = PathBuf::from(&config.storage.store_path);
    if let Some(parent) = store_path.parent()
        && !parent.exists()
    {
        debug!(?parent, "run_daemon: creating store directory");
        fs::create_dir_all(parent)?;
    }

    let bus = create_event_bus();
    let state = StateManager::spawn(&store_path, Arc::clone(&bus)).context("Failed to open the store")?;
    info!("StateManager initialized");

    // Event sinks: one persists the audit trail, one keeps counters
    let audit_handle = spawn_audit_sink(&bus, state.clone());
    let metrics = Arc::new(Metrics::new());
    let metrics_handle = spawn_metrics_sink(&bus, Arc::clone(&metrics));
    info!("Event sinks started");

    // Provider chosen once at startup; call sites only see the trait
    let provider = create_provider(config).context("Failed to initialize the telephony provider")?;
    if !provider.is_ready().await {
        warn!(provider = provider.name(), "Provider not ready at startup; dispatches will retry");
    }
    info!("Provider initialized ({})", provider.name());

    let token = TokenVerifier::from_config(&config.human_check)?;
    let admission = AdmissionController::new(state.clone(), Arc::clone(&bus), token, &config.admission);
    let gate = ConcurrencyGate::new(state.clone(), Arc::clone(&bus), &config.calls);
    let notifier = Arc::new(Notifier::new(Arc::clone(&provider), Arc::clone(&bus), config));
    let verifier = Verifier::new(
        state.clone(),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        Arc::clone(&notifier),
        &config.verification,
    );
    let engine = Arc::new(Engine::new(
        state.clone(),
        Arc::clone(&bus),
        provider,
        admission,
        gate,
        verifier,
        notifier,
        config.clone(),
    ));
    info!("Engine initialized");

    // Route requests stranded by a previous crash back into the retry path
    if let Err(e) = engine.recover_on_startup().await {
        warn!(error = %e, "Startup recovery failed; continuing");
    }

    // Shutdown fan-out: IPC Shutdown, SIGINT, and SIGTERM all land here
    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    // IPC listener for the CLI
    let socket_path = ipc::socket_path(&config.storage.runtime_dir);
    let (listener, socket_path) = ipc::create_listener_at(&socket_path)?;
    info!(?socket_path, "IPC socket listening");

    let listener_handle = tokio::spawn(ipc::run_listener(
        listener,
        Arc::clone(&engine),
        state.clone(),
        Arc::clone(&metrics),
        shutdown_tx.clone(),
    ));

    // Supervised sweep workers. Each incarnation gets its own shutdown
    // receiver; the supervisor restarts faulting ones with backoff.
    let staleness = std::time::Duration::from_secs(config.supervisor.staleness_secs);
    let retry_interval = std::time::Duration::from_secs(config.retry.sweep_interval_secs);

    let retry_engine = Arc::clone(&engine);
    let retry_metrics = Arc::clone(&metrics);
    let retry_shutdown = shutdown_tx.clone();
    let retry_handle = tokio::spawn(supervise(
        RETRY_WORKER,
        staleness,
        Arc::clone(&metrics),
        Arc::clone(&bus),
        shutdown_tx.subscribe(),
        move || {
            run_retry_sweeper(
                Arc::clone(&retry_engine),
                Arc::clone(&retry_metrics),
                retry_interval,
                retry_shutdown.subscribe(),
            )
        },
    ));
    info!("Retry sweeper started");

    let escalation_handle = if config.escalation.enabled && !config.escalation.targets.is_empty() {
        let escalation_interval = std::time::Duration::from_secs(config.escalation.sweep_interval_secs);
        let escalation_engine = Arc::clone(&engine);
        let escalation_metrics = Arc::clone(&metrics);
        let escalation_shutdown = shutdown_tx.clone();
        let handle = tokio::spawn(supervise(
            ESCALATION_WORKER,
            staleness,
            Arc::clone(&metrics),
            Arc::clone(&bus),
            shutdown_tx.subscribe(),
            move || {
                run_escalation_sweeper(
                    Arc::clone(&escalation_engine),
                    Arc::clone(&escalation_metrics),
                    escalation_interval,
                    escalation_shutdown.subscribe(),
                )
            },
        ));
        info!("Escalation sweeper started");
        Some(handle)
    } else {
        debug!("run_daemon: escalation disabled or no targets, sweeper not started");
        None
    };

    info!("Daemon running. Press Ctrl+C to stop.");

    // Set up signal handlers
    debug!("run_daemon: setting up signal handlers");
    let mut shutdown_rx = shutdown_tx.subscribe();
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                debug!("run_daemon: SIGINT received, initiating shutdown");
                warn!("SIGINT received");
                let _ = shutdown_tx.send(());
            }
            _ = sigterm.recv() => {
                debug!("run_daemon: SIGTERM received, initiating shutdown");
                warn!("SIGTERM received");
                let _ = shutdown_tx.send(());
            }
            _ = shutdown_rx.recv() => {
                debug!("run_daemon: shutdown requested over IPC");
            }
        }
    }

    info!("Daemon shutting down...");
    info!(metrics = %metrics.snapshot_json(), "Final counters");

    // Wait for the workers and the listener to drain
    debug!("run_daemon: waiting for workers to finish");
    let _ = retry_handle.await;
    if let Some(handle) = escalation_handle {
        let _ = handle.await;
    }
    let _ = listener_handle.await;

    // Cleanup - remove IPC socket
    debug!("run_daemon: cleaning up IPC socket");
    ipc::cleanup_socket(&socket_path);

    // Stop the store actor last; the sinks hold a handle to it
    debug!("run_daemon: stopping state manager");
    state.shutdown().await?;
    audit_handle.abort();
    metrics_handle.abort();

    debug!("run_daemon: shutdown complete");
    Ok(())
}
