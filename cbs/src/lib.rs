//! CallStore - generic persistent record store over SQLite
//!
//! Records are JSON documents grouped into collections, with secondary
//! index rows for the fields each record type declares. One writable
//! handle per store at a time; read-only handles for inspection.
//!
//! # Example
//!
//! ```ignore
//! use callstore::{Store, Record, Filter, FilterOp, IndexValue};
//!
//! let mut store = Store::open("~/.local/share/callbackd/store.db")?;
//! let id = store.create(request)?;
//! let calling: Vec<CallbackRequest> = store.list(&[Filter {
//!     field: "status".to_string(),
//!     op: FilterOp::Eq,
//!     value: IndexValue::String("calling".to_string()),
//! }])?;
//! ```

pub mod cli;
mod record;
mod store;

pub use record::{Filter, FilterOp, IndexValue, Record, now_ms};
pub use store::{CollectionStats, Store, default_store_path};
