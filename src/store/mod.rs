//! Persistence layer: the store capability trait and the multi-store router.
//!
//! The engine talks to storage exclusively through [`DocumentStore`], a
//! small capability set over JSON documents. [`JobStore`] composes one main
//! document store with any number of named auxiliary stores and is the only
//! communication channel between jobs.
//!
//! Backends:
//! - [`MemoryStore`]: volatile, the default for tests and `run_locally`.
//! - `SqliteStore`: durable, behind the `sqlite` cargo feature.

pub mod jobstore;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

pub use jobstore::{
    BlobMarker, GetOutputError, JobStore, Load, OutputNotFoundError, SaveRequest, Which,
    BLOB_CLASS,
};
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Errors raised by store backends and the router.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// The backend itself failed.
    #[error("store backend error: {0}")]
    #[diagnostic(code(jobflow::store::backend))]
    Backend(String),

    /// A document to upsert is missing one of the requested key fields.
    #[error("document is missing key field '{field}'")]
    #[diagnostic(
        code(jobflow::store::missing_key_field),
        help("Every document passed to update must carry all key fields.")
    )]
    MissingKeyField { field: String },

    /// A routing table or blob marker names an auxiliary store that the
    /// router does not know.
    #[error("unrecognised additional store name: {name}")]
    #[diagnostic(
        code(jobflow::store::unknown_store),
        help("Register the auxiliary store on the JobStore before saving to it.")
    )]
    UnknownStore { name: String },

    /// A value failed to encode or decode on its way through the store.
    #[error(transparent)]
    #[diagnostic(code(jobflow::store::serialization))]
    Serialization(#[from] crate::codec::SerializationError),

    /// SQLx backend failure.
    #[cfg(feature = "sqlite")]
    #[error("sqlx error: {0}")]
    #[diagnostic(code(jobflow::store::sqlx))]
    Sqlx(#[from] sqlx::Error),
}

/// Sort direction for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sort specification: a top-level field and a direction.
#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    #[must_use]
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    #[must_use]
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }
}

/// A conjunction of exact matches on top-level document fields.
///
/// # Examples
///
/// ```
/// use jobflow::store::Criteria;
/// use serde_json::json;
///
/// let criteria = Criteria::new().field("uuid", "abc").field("index", 2);
/// assert!(criteria.matches(&json!({"uuid": "abc", "index": 2, "output": 9})));
/// assert!(!criteria.matches(&json!({"uuid": "abc", "index": 1})));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    terms: Vec<(String, Value)>,
}

impl Criteria {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Whether a document satisfies every term.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.terms
            .iter()
            .all(|(field, value)| doc.get(field.as_str()) == Some(value))
    }
}

/// Capability set every storage backend must provide.
///
/// All documents are JSON values; backends are free to store them however
/// they like, as long as `update` upserts atomically per compound key and
/// `query` reflects previously committed updates.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open connections or prepare backing resources.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Release backing resources.
    async fn close(&self) -> Result<(), StoreError>;

    /// Documents matching `criteria`, optionally sorted; `limit == 0` means
    /// no limit.
    async fn query(
        &self,
        criteria: &Criteria,
        sort: Option<&Sort>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError>;

    /// First document matching `criteria` under the given sort.
    async fn query_one(
        &self,
        criteria: &Criteria,
        sort: Option<&Sort>,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self.query(criteria, sort, 1).await?.into_iter().next())
    }

    /// Upsert documents, using `key` as the compound uniqueness key.
    async fn update(&self, docs: Vec<Value>, key: &[&str]) -> Result<(), StoreError>;

    /// Delete matching documents, returning how many were removed.
    async fn remove(&self, criteria: &Criteria) -> Result<u64, StoreError>;

    /// Count matching documents.
    async fn count(&self, criteria: &Criteria) -> Result<u64, StoreError>;

    /// Distinct values of a top-level field among matching documents.
    async fn distinct(&self, field: &str, criteria: &Criteria) -> Result<Vec<Value>, StoreError>;
}

/// Total order over JSON scalars used for query sorting.
///
/// Numbers order numerically, strings lexicographically; mixed kinds order
/// by kind. Missing fields sort first.
pub(crate) fn compare_field(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

/// Sort documents in place by a top-level field.
pub(crate) fn sort_docs(docs: &mut [Value], sort: &Sort) {
    docs.sort_by(|a, b| {
        let ordering = compare_field(a.get(sort.field.as_str()), b.get(sort.field.as_str()));
        match sort.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
}
