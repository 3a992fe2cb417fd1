//! Record trait and filter types
//!
//! Anything persisted in the store implements Record: it names its
//! collection, exposes its id and updated_at, and declares which fields
//! get secondary-index rows for filtered queries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value stored in the secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexValue {
    String(String),
    Integer(i64),
}

impl std::fmt::Display for IndexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Integer(i) => write!(f, "{}", i),
        }
    }
}

/// Comparison operator for index filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    /// SQL operator text for this comparison
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A single predicate against an indexed field
///
/// Filters only see fields the record exposes via `indexed_fields()`; a
/// record that does not index the field never matches (including for Ne).
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

/// Trait for records persisted in the store
pub trait Record {
    /// Unique record ID
    fn id(&self) -> &str;

    /// Last update timestamp (unix ms)
    fn updated_at(&self) -> i64;

    /// Collection (table namespace) this record type lives in
    fn collection_name() -> &'static str
    where
        Self: Sized;

    /// Fields to maintain secondary-index rows for
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
