//! Call outcome classification
//!
//! Maps a provider-reported call status and duration to the request's
//! next step. Only a connected call that lasted at least the configured
//! minimum counts as completed; a pickup that drops immediately is a
//! failure like any other and goes back through the retry path.

use tracing::debug;

/// Classified end state of a provider call
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeClass {
    /// The visitor answered and stayed on long enough
    Completed,
    /// The call did not connect, or connected too briefly to count
    Failed { reason: String },
    /// Interim or unrecognized provider statuses, logged and dropped
    Ignored,
}

impl OutcomeClass {
    /// Status message to record on the request, if any
    pub fn status_message(&self) -> Option<String> {
        match self {
            OutcomeClass::Completed => Some("Call completed successfully".to_string()),
            OutcomeClass::Failed { reason } => Some(format!("Call {reason}")),
            OutcomeClass::Ignored => None,
        }
    }
}

/// Classify a raw provider status against the minimum-duration rule
pub fn classify(raw_status: &str, duration_secs: u32, min_call_secs: u32) -> OutcomeClass {
    let status = raw_status.trim().to_ascii_lowercase();
    debug!(%status, duration_secs, min_call_secs, "classify: called");

    match status.as_str() {
        "completed" => {
            if duration_secs >= min_call_secs {
                OutcomeClass::Completed
            } else {
                OutcomeClass::Failed {
                    reason: "short-completed".to_string(),
                }
            }
        }
        "no-answer" | "busy" | "failed" => OutcomeClass::Failed { reason: status },
        _ => {
            debug!(%status, "classify: unrecognized status, ignoring");
            OutcomeClass::Ignored
        }
    }
}
