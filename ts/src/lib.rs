//! Generic persistent record store.
//!
//! A `Store` keeps one JSON file per record under
//! `<base>/<collection>/<id>.json`, written atomically
//! (write-temp-then-rename), plus a SQLite-backed secondary index rebuilt
//! from those files that makes filtered `list` queries fast without a full
//! directory scan. The on-disk files are the source of truth; the index is
//! disposable and can always be regenerated with `rebuild_indexes`.

mod error;
mod store;

pub use error::StoreError;
pub use store::Store;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that can be matched against in a `Filter`.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        IndexValue::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        IndexValue::Int(v)
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        IndexValue::Bool(v)
    }
}

/// Comparison used when matching an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// One condition in a `list` query. Multiple filters are ANDed together.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }
}

/// A type that can be stored by `Store`.
///
/// `collection()` names the subdirectory the record's JSON files live in;
/// `indexed_fields()` lists the attributes `list()` can filter on without
/// deserialising every record.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> String;
    fn collection() -> &'static str
    where
        Self: Sized;
    fn updated_at(&self) -> i64;
    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        Vec::new()
    }

    /// Ordering key used by `Store::list`. Defaults to `updated_at`;
    /// record types that need an insertion-order guarantee independent of
    /// mutation (e.g. queue ordering) should override this with a
    /// monotonic sequence captured once at creation.
    fn seq_key(&self) -> i64 {
        self.updated_at()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
