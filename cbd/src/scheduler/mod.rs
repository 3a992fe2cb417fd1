//! Periodic workers driving retries and escalation
//!
//! Each sweeper is a small timed loop over an `Engine` sweep method,
//! supervised by `crate::supervisor` so a faulting loop gets restarted
//! with backoff instead of silently dying.

pub mod escalation;
pub mod retry;

pub use escalation::{ESCALATION_WORKER, run_escalation_sweeper};
pub use retry::{RETRY_WORKER, backoff, run_retry_sweeper};
