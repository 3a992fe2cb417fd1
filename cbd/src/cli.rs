//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// Callbackd - callback request lifecycle daemon
#[derive(Parser)]
#[command(
    name = "cbd",
    about = "Callback request lifecycle daemon: verification, dispatch, retries, escalation",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the background
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon liveness, request counts, and worker health
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Submit a callback request
    Submit {
        /// Visitor phone number (any common format)
        phone: String,

        /// Visitor name
        #[arg(short, long)]
        name: Option<String>,

        /// Visitor email
        #[arg(short, long)]
        email: Option<String>,

        /// Priority (low, default, high)
        #[arg(short, long)]
        priority: Option<String>,

        /// Human-verification token from the form
        #[arg(long)]
        token: Option<String>,

        /// Honeypot form field; forwarded verbatim for bot testing
        #[arg(long, hide = true)]
        website: Option<String>,

        /// Submitter address, forwarded by the web front-end
        #[arg(long, default_value = "local")]
        remote_addr: String,

        /// Submitter user agent, forwarded by the web front-end
        #[arg(long, default_value = "cbd-cli")]
        agent: String,
    },

    /// Send a verification code to the visitor
    RequestCode {
        /// Request ID
        id: String,
    },

    /// Check a verification code
    Verify {
        /// Request ID
        id: String,

        /// The code the visitor received
        code: String,
    },

    /// Dispatch the call for a verified request
    Initiate {
        /// Request ID
        id: String,
    },

    /// Cancel a request
    Cancel {
        /// Request ID
        id: String,
    },

    /// Show one request with its audit trail
    Show {
        /// Request ID
        id: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List requests
    List {
        /// Filter by status (pending, verified, calling, completed,
        /// failed, retry_scheduled, dead_letter, cancelled, sms_sent)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show metrics and statistics
    Metrics {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },

    /// Internal: Run as daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,

    /// Internal: Feed a provider call outcome into the daemon
    ///
    /// The bridge through which a status-callback receiver reports how
    /// a call ended.
    #[command(hide = true)]
    Outcome {
        /// Request ID
        id: String,

        /// Provider status string (completed, busy, no-answer, ...)
        status: String,

        /// Call duration in seconds
        #[arg(default_value = "0")]
        duration_secs: u32,
    },
}

/// Check if the daemon is running (lightweight check for help display)
pub fn is_daemon_running() -> bool {
    debug!("is_daemon_running: called");
    let pid_file = PathBuf::from(&crate::config::StorageConfig::default().runtime_dir).join("cbd.pid");

    if !pid_file.exists() {
        return false;
    }

    if let Ok(contents) = std::fs::read_to_string(&pid_file)
        && let Ok(pid) = contents.trim().parse::<u32>()
    {
        let exists = PathBuf::from(format!("/proc/{}", pid)).exists();
        debug!(pid, exists, "is_daemon_running: checked process existence");
        return exists;
    }

    false
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    PathBuf::from(&crate::config::StorageConfig::default().runtime_dir)
        .join("logs")
        .join("cbd.log")
}

/// Generate the after_help text with daemon status and log location
pub fn generate_after_help() -> String {
    let daemon_running = is_daemon_running();
    let log_path = get_log_path();

    let mut help = String::new();

    help.push_str("Daemon:\n");
    let daemon_icon = if daemon_running { "\u{2705}" } else { "\u{274C}" };
    let daemon_status = if daemon_running { "running" } else { "stopped" };
    help.push_str(&format!("  {} {}\n", daemon_icon, daemon_status));

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", log_path.display()));

    help
}

/// Output format for status/metrics commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => Err(format!("Unknown format: {}. Use: text, json, or table", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}
