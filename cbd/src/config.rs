//! Callbackd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Main callbackd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider selection and shared dispatch settings
    pub provider: ProviderConfig,

    /// Hosted (REST) provider settings
    pub hosted: HostedConfig,

    /// PBX (manager protocol) provider settings
    pub pbx: PbxConfig,

    /// Submission gate settings
    pub admission: AdmissionConfig,

    /// Human-verification token gate
    #[serde(rename = "human-check")]
    pub human_check: HumanCheckConfig,

    /// Verification code settings
    pub verification: VerificationConfig,

    /// Concurrency ceilings for dispatch
    pub calls: CallsConfig,

    /// Retry scheduler settings
    pub retry: RetryConfig,

    /// Escalation engine settings
    pub escalation: EscalationConfig,

    /// Business hours window
    pub hours: HoursConfig,

    /// Notification targets
    pub notify: NotifyConfig,

    /// Storage paths
    pub storage: StorageConfig,

    /// Worker supervisor settings
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Checks that the credentials for the configured provider are present.
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        match self.provider.kind.as_str() {
            "hosted" => {
                if std::env::var(&self.hosted.account_sid_env).is_err() {
                    return Err(eyre::eyre!(
                        "Hosted provider account SID not found. Set the {} environment variable.",
                        self.hosted.account_sid_env
                    ));
                }
                if std::env::var(&self.hosted.auth_token_env).is_err() {
                    return Err(eyre::eyre!(
                        "Hosted provider auth token not found. Set the {} environment variable.",
                        self.hosted.auth_token_env
                    ));
                }
            }
            "pbx" => {
                if std::env::var(&self.pbx.secret_env).is_err() {
                    return Err(eyre::eyre!(
                        "PBX manager secret not found. Set the {} environment variable.",
                        self.pbx.secret_env
                    ));
                }
            }
            other => {
                return Err(eyre::eyre!("Unknown provider kind: '{}'. Supported: hosted, pbx", other));
            }
        }

        if self.human_check.enabled && std::env::var(&self.human_check.secret_env).is_err() {
            return Err(eyre::eyre!(
                "Human-check secret not found. Set the {} environment variable.",
                self.human_check.secret_env
            ));
        }

        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .callbackd.yml
        let local_config = PathBuf::from(".callbackd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/callbackd/callbackd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("callbackd").join("callbackd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Provider selection and shared dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider kind: "hosted" or "pbx"
    pub kind: String,

    /// The provisioned number calls and messages originate from
    #[serde(rename = "service-number")]
    pub service_number: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "hosted".to_string(),
            service_number: String::new(),
        }
    }
}

/// Hosted (REST) provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the account SID
    #[serde(rename = "account-sid-env")]
    pub account_sid_env: String,

    /// Environment variable containing the auth token
    #[serde(rename = "auth-token-env")]
    pub auth_token_env: String,

    /// Ring timeout passed to the provider, in seconds
    #[serde(rename = "call-timeout-secs")]
    pub call_timeout_secs: u32,

    /// HTTP request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,

    /// Optional status-callback URL passed through on calls
    #[serde(rename = "status-callback-url")]
    pub status_callback_url: Option<String>,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
            account_sid_env: "TWILIO_SID".to_string(),
            auth_token_env: "TWILIO_AUTH_TOKEN".to_string(),
            call_timeout_secs: 20,
            request_timeout_ms: 30_000,
            status_callback_url: None,
        }
    }
}

impl HostedConfig {
    /// Read (account SID, auth token) from the configured environment variables
    pub fn credentials(&self) -> Result<(String, String)> {
        let sid = std::env::var(&self.account_sid_env)
            .map_err(|_| eyre::eyre!("{} environment variable not set", self.account_sid_env))?;
        let token = std::env::var(&self.auth_token_env)
            .map_err(|_| eyre::eyre!("{} environment variable not set", self.auth_token_env))?;
        Ok((sid, token))
    }
}

/// PBX (manager protocol) provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PbxConfig {
    /// Manager interface host
    pub host: String,

    /// Manager interface port
    pub port: u16,

    /// Manager username
    pub username: String,

    /// Environment variable containing the manager secret
    #[serde(rename = "secret-env")]
    pub secret_env: String,

    /// Originate channel template; `{number}` is replaced with the destination
    pub channel: String,

    /// Dialplan context for the second leg
    pub context: String,

    /// Dialplan extension for the second leg
    pub extension: String,

    /// TCP connect timeout in milliseconds
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,

    /// Originate ring timeout in seconds
    #[serde(rename = "originate-timeout-secs")]
    pub originate_timeout_secs: u32,
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "callbackd".to_string(),
            secret_env: "PBX_SECRET".to_string(),
            channel: "SIP/trunk/{number}".to_string(),
            context: "callbacks".to_string(),
            extension: "s".to_string(),
            connect_timeout_ms: 5_000,
            originate_timeout_secs: 20,
        }
    }
}

impl PbxConfig {
    /// Read the manager secret from the configured environment variable
    pub fn secret(&self) -> Result<String> {
        std::env::var(&self.secret_env).map_err(|_| eyre::eyre!("{} environment variable not set", self.secret_env))
    }
}

/// Submission gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Default country prefix for bare 10-digit numbers
    #[serde(rename = "default-country")]
    pub default_country: String,

    /// Window within which a second submission from the same contact
    /// auto-cancels the first, in minutes
    #[serde(rename = "duplicate-window-mins")]
    pub duplicate_window_mins: u32,

    /// Age past which a Calling request is considered stuck, in seconds
    #[serde(rename = "stale-calling-secs")]
    pub stale_calling_secs: u32,

    /// Maximum requests accepted in a trailing 24h window
    #[serde(rename = "daily-cap")]
    pub daily_cap: u64,

    /// Maximum requests sharing one abuse fingerprint in a trailing 24h window
    #[serde(rename = "fingerprint-ceiling")]
    pub fingerprint_ceiling: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_country: "+1".to_string(),
            duplicate_window_mins: 60,
            stale_calling_secs: 300,
            daily_cap: 200,
            fingerprint_ceiling: 20,
        }
    }
}

/// Human-verification token gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanCheckConfig {
    /// Whether the token gate runs at all
    pub enabled: bool,

    /// Verifier endpoint
    pub url: String,

    /// Environment variable containing the verifier secret
    #[serde(rename = "secret-env")]
    pub secret_env: String,

    /// Verifier request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for HumanCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://www.google.com/recaptcha/api/siteverify".to_string(),
            secret_env: "RECAPTCHA_SECRET".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Verification code settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Digits per code
    #[serde(rename = "code-length")]
    pub code_length: u32,

    /// Code lifetime from issuance, in minutes
    #[serde(rename = "expiry-mins")]
    pub expiry_mins: u32,

    /// Attempts allowed per code
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// When the status transition commits relative to the verified-flag write
    #[serde(rename = "commit-mode")]
    pub commit_mode: CommitMode,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            expiry_mins: 10,
            max_attempts: 3,
            commit_mode: CommitMode::OnCommit,
        }
    }
}

/// Commit policy for the post-verification status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitMode {
    /// Transition only after the verified-flag write is durable (default)
    OnCommit,
    /// Transition first, then write the verified flag
    Immediate,
    /// Reply first; a spawned follow-up task applies the transition
    Deferred,
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitMode::OnCommit => "on-commit",
            CommitMode::Immediate => "immediate",
            CommitMode::Deferred => "deferred",
        };
        write!(f, "{}", s)
    }
}

/// Concurrency ceilings for dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    /// Maximum simultaneous outbound calls
    #[serde(rename = "max-concurrent-calls")]
    pub max_concurrent_calls: u64,

    /// Maximum requests verified within the rolling 5-minute window
    #[serde(rename = "max-concurrent-messages")]
    pub max_concurrent_messages: u64,

    /// What happens when a ceiling is hit
    pub overflow: OverflowPolicy,

    /// Minimum answered duration for a call to count as completed, in seconds
    #[serde(rename = "min-call-secs")]
    pub min_call_secs: u32,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 3,
            max_concurrent_messages: 10,
            overflow: OverflowPolicy::Reject,
            min_call_secs: 20,
        }
    }
}

/// Overflow policy when a concurrency ceiling is hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Deny the dispatch; the request keeps its pre-dispatch status
    Reject,
    /// Log the breach and proceed (soft cap)
    Queue,
    /// Accepted for compatibility; behaves exactly like `Queue`
    Delay,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::Queue => "queue",
            OverflowPolicy::Delay => "delay",
        };
        write!(f, "{}", s)
    }
}

/// Retry scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first before dead-lettering
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Seconds between due-retry sweeps
    #[serde(rename = "sweep-interval-secs")]
    pub sweep_interval_secs: u64,

    /// Maximum rows re-dispatched per sweep
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sweep_interval_secs: 60,
            batch_size: 10,
        }
    }
}

/// Escalation engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Whether the escalation sweep runs at all
    pub enabled: bool,

    /// Seconds a request may sit in Calling before advancing a level
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Seconds between escalation sweeps
    #[serde(rename = "sweep-interval-secs")]
    pub sweep_interval_secs: u64,

    /// Fallback destinations; level N (N >= 1) dials targets[N - 1]
    pub targets: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 300,
            sweep_interval_secs: 60,
            targets: Vec::new(),
        }
    }
}

/// Business hours window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoursConfig {
    /// Opening time, "HH:MM"
    pub start: String,

    /// Closing time, "HH:MM" (inclusive)
    pub end: String,

    /// Fixed UTC offset of the business, e.g. "-05:00"
    #[serde(rename = "utc-offset")]
    pub utc_offset: String,

    /// Closed on Saturday and Sunday
    #[serde(rename = "weekdays-only")]
    pub weekdays_only: bool,
}

impl Default for HoursConfig {
    fn default() -> Self {
        Self {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            utc_offset: "-05:00".to_string(),
            weekdays_only: true,
        }
    }
}

/// Notification targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// The business number callbacks are placed to and texts are sent to
    #[serde(rename = "business-phone")]
    pub business_phone: String,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the callstore database
    #[serde(rename = "store-path")]
    pub store_path: String,

    /// Directory for the PID file, socket, and daemon log
    #[serde(rename = "runtime-dir")]
    pub runtime_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/callbackd on Linux)
        let base = dirs::data_local_dir()
            .map(|d| d.join("callbackd"))
            .unwrap_or_else(|| PathBuf::from(".callbackd"));

        Self {
            store_path: base.join("store.db").to_string_lossy().into_owned(),
            runtime_dir: base.to_string_lossy().into_owned(),
        }
    }
}

/// Worker supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Heartbeat age past which a worker counts as stalled, in seconds
    #[serde(rename = "staleness-secs")]
    pub staleness_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { staleness_secs: 120 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.provider.kind, "hosted");
        assert_eq!(config.calls.max_concurrent_calls, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.verification.commit_mode, CommitMode::OnCommit);
        assert_eq!(config.admission.fingerprint_ceiling, 20);
        assert!(!config.escalation.enabled);
        assert!(!config.human_check.enabled);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
provider:
  kind: pbx
  service-number: "+15550001111"

pbx:
  host: pbx.example.com
  port: 5039
  username: orchestrator
  secret-env: MY_PBX_SECRET
  channel: "PJSIP/out/{number}"

admission:
  duplicate-window-mins: 30
  daily-cap: 50

verification:
  code-length: 4
  commit-mode: deferred

calls:
  max-concurrent-calls: 5
  overflow: queue

escalation:
  enabled: true
  targets:
    - "+15550002222"
    - "+15550003333"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.provider.kind, "pbx");
        assert_eq!(config.pbx.host, "pbx.example.com");
        assert_eq!(config.pbx.port, 5039);
        assert_eq!(config.pbx.secret_env, "MY_PBX_SECRET");
        assert_eq!(config.admission.duplicate_window_mins, 30);
        assert_eq!(config.admission.daily_cap, 50);
        assert_eq!(config.verification.code_length, 4);
        assert_eq!(config.verification.commit_mode, CommitMode::Deferred);
        assert_eq!(config.calls.max_concurrent_calls, 5);
        assert_eq!(config.calls.overflow, OverflowPolicy::Queue);
        assert!(config.escalation.enabled);
        assert_eq!(config.escalation.targets.len(), 2);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
notify:
  business-phone: "+15550009999"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        // Specified value
        assert_eq!(config.notify.business_phone, "+15550009999");

        // Defaults for unspecified
        assert_eq!(config.provider.kind, "hosted");
        assert_eq!(config.hosted.account_sid_env, "TWILIO_SID");
        assert_eq!(config.hours.start, "09:00");
        assert_eq!(config.retry.batch_size, 10);
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let mut config = Config::default();
        config.hosted.account_sid_env = "CBD_TEST_SID_THAT_IS_NEVER_SET".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CBD_TEST_SID_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_validate_rejects_unknown_kind() {
        let mut config = Config::default();
        config.provider.kind = "carrier-pigeon".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_validate_accepts_present_credentials() {
        let mut config = Config::default();
        // PATH is always present; good enough to prove the env lookup
        config.hosted.account_sid_env = "PATH".to_string();
        config.hosted.auth_token_env = "PATH".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overflow_policy_display() {
        assert_eq!(OverflowPolicy::Reject.to_string(), "reject");
        assert_eq!(OverflowPolicy::Queue.to_string(), "queue");
        assert_eq!(OverflowPolicy::Delay.to_string(), "delay");
    }

    #[test]
    fn test_commit_mode_round_trip() {
        for (mode, text) in [
            (CommitMode::OnCommit, "\"on-commit\""),
            (CommitMode::Immediate, "\"immediate\""),
            (CommitMode::Deferred, "\"deferred\""),
        ] {
            assert_eq!(serde_json::to_string(&mode).unwrap(), text);
            let parsed: CommitMode = serde_json::from_str(text).unwrap();
            assert_eq!(parsed, mode);
        }
    }
}
