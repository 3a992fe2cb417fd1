//! Domain types for callback orchestration
//!
//! All persisted types implement the Record trait for CallStore.

pub mod code;
pub mod contact;
pub mod fingerprint;
pub mod id;
pub mod priority;
pub mod request;

pub use code::VerificationCode;
pub use contact::normalize_phone;
pub use fingerprint::fingerprint;
pub use id::generate_id;
pub use priority::Priority;
pub use request::{CallStatus, CallbackRequest};

// Re-export store types so consumers can use domain::* for persistence
pub use callstore::{Filter, FilterOp, IndexValue, Record, Store, now_ms};
