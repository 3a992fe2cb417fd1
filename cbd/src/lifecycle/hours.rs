//! Business hours evaluation
//!
//! Decides whether outbound calls may be placed right now. Outside the
//! window the dispatcher sends the after-hours text instead of calling,
//! and the retry sweep leaves due rows alone. Evaluation errors fail
//! open so a bad config never silences the phone entirely.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use tracing::{debug, error};

use crate::config::HoursConfig;

/// Outcome of a business-hours evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct HoursDecision {
    /// Whether calls may be placed right now
    pub open: bool,
    /// Explanation, quoted in status messages and the after-hours reply
    pub message: String,
}

impl HoursDecision {
    fn closed(message: impl Into<String>) -> Self {
        Self {
            open: false,
            message: message.into(),
        }
    }
}

/// Evaluate business hours against the current wall clock
pub fn evaluate(config: &HoursConfig) -> HoursDecision {
    evaluate_at(config, Utc::now())
}

/// Evaluation pinned to a given instant, for tests and deterministic sweeps
pub fn evaluate_at(config: &HoursConfig, now_utc: DateTime<Utc>) -> HoursDecision {
    match check(config, now_utc) {
        Ok(decision) => {
            debug!(open = decision.open, message = %decision.message, "evaluate_at: decided");
            decision
        }
        Err(error) => {
            error!(%error, "Business hours evaluation failed; treating as open");
            HoursDecision {
                open: true,
                message: "Business hours check unavailable".to_string(),
            }
        }
    }
}

fn check(config: &HoursConfig, now_utc: DateTime<Utc>) -> eyre::Result<HoursDecision> {
    let offset = parse_offset(&config.utc_offset)?;
    let now = now_utc.with_timezone(&offset);

    if config.weekdays_only && matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return Ok(HoursDecision::closed("Outside business hours (weekend)"));
    }

    let start = NaiveTime::parse_from_str(&config.start, "%H:%M")?;
    let end = NaiveTime::parse_from_str(&config.end, "%H:%M")?;
    let current = now.time();

    // Bounds are inclusive on both ends
    if current < start || current > end {
        return Ok(HoursDecision::closed(format!(
            "Outside business hours ({}-{} {})",
            config.start, config.end, config.utc_offset
        )));
    }

    Ok(HoursDecision {
        open: true,
        message: "Within business hours".to_string(),
    })
}

/// Parse a "+HH:MM" / "-HH:MM" offset string
fn parse_offset(raw: &str) -> eyre::Result<FixedOffset> {
    let (positive, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (true, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (false, rest)
    } else {
        eyre::bail!("UTC offset must start with + or -: '{raw}'");
    };

    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| eyre::eyre!("UTC offset must look like +HH:MM: '{raw}'"))?;
    let hours: i32 = hours.parse()?;
    let minutes: i32 = minutes.parse()?;
    let mut secs = hours * 3600 + minutes * 60;
    if !positive {
        secs = -secs;
    }

    FixedOffset::east_opt(secs).ok_or_else(|| eyre::eyre!("UTC offset out of range: '{raw}'"))
}
