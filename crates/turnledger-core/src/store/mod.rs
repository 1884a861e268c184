//! Document-store read seam
//!
//! The core never writes. Everything it needs from the datastore is
//! `find` and `distinct` with a small, fixed filter vocabulary. [`Reader`]
//! wraps any [`DocumentStore`] and applies the per-operation timeout ceiling.

pub mod memory;
pub mod value;

use crate::error::CoreError;
use crate::models::{DateRange, IdValue, SortOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use memory::MemoryStore;

/// A raw document as read from the store
pub type Document = Map<String, Value>;

/// Replica preference for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    Primary,
    #[default]
    SecondaryPreferred,
}

/// One filter predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Field equals any of the values (strict representation equality)
    In { field: String, values: Vec<Value> },
    /// Field equals the value
    Eq { field: String, value: Value },
    /// Field is a timestamp inside the range
    TimeRange { field: String, range: DateRange },
    /// Field presence
    Exists { field: String, exists: bool },
    /// Keyset continuation: strictly after `(at, id)` in the given order
    Seek {
        time_field: String,
        id_field: String,
        at: DateTime<Utc>,
        id: String,
        order: SortOrder,
    },
}

/// Conjunction of clauses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Field matches any stored form of the given identifiers
    pub fn ids(self, field: impl Into<String>, ids: &[IdValue]) -> Self {
        self.push(Clause::In {
            field: field.into(),
            values: ids.iter().map(IdValue::to_value).collect(),
        })
    }

    pub fn eq(self, field: impl Into<String>, value: Value) -> Self {
        self.push(Clause::Eq {
            field: field.into(),
            value,
        })
    }

    pub fn time_range(self, field: impl Into<String>, range: DateRange) -> Self {
        self.push(Clause::TimeRange {
            field: field.into(),
            range,
        })
    }

    pub fn exists(self, field: impl Into<String>, exists: bool) -> Self {
        self.push(Clause::Exists {
            field: field.into(),
            exists,
        })
    }

    pub fn extend(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    /// Evaluate against a document
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|c| clause_matches(c, doc))
    }

    /// Field names referenced by this filter
    pub fn fields(&self) -> Vec<&str> {
        self.clauses
            .iter()
            .map(|c| match c {
                Clause::In { field, .. }
                | Clause::Eq { field, .. }
                | Clause::TimeRange { field, .. }
                | Clause::Exists { field, .. } => field.as_str(),
                Clause::Seek { time_field, .. } => time_field.as_str(),
            })
            .collect()
    }
}

fn clause_matches(clause: &Clause, doc: &Document) -> bool {
    match clause {
        Clause::In { field, values } => value::get_path(doc, field)
            .map(|v| values.iter().any(|candidate| candidate == v))
            .unwrap_or(false),
        Clause::Eq { field, value } => value::get_path(doc, field) == Some(value),
        Clause::TimeRange { field, range } => value::get_path(doc, field)
            .and_then(value::as_datetime)
            .map(|at| range.contains(at))
            .unwrap_or(false),
        Clause::Exists { field, exists } => {
            let present = value::get_path(doc, field).is_some_and(|v| !v.is_null());
            present == *exists
        }
        Clause::Seek {
            time_field,
            id_field,
            at,
            id,
            order,
        } => {
            let Some(doc_at) = value::get_path(doc, time_field).and_then(value::as_datetime)
            else {
                return false;
            };
            let doc_id = value::get_path(doc, id_field)
                .and_then(IdValue::from_value)
                .map(|v| v.canonical())
                .unwrap_or_default();
            let ordering = doc_at.cmp(at).then_with(|| doc_id.as_str().cmp(id.as_str()));
            order.apply(ordering) == std::cmp::Ordering::Greater
        }
    }
}

/// Sort key for `find`
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

/// Per-operation read options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadOptions {
    pub timeout: Duration,
    pub read_preference: ReadPreference,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            read_preference: ReadPreference::SecondaryPreferred,
        }
    }
}

/// A `find` request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: Filter,
    pub projection: Option<Vec<String>>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }
}

/// Read interface to the document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(
        &self,
        collection: &str,
        query: &FindQuery,
        options: &ReadOptions,
    ) -> Result<Vec<Document>, CoreError>;

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
        options: &ReadOptions,
    ) -> Result<Vec<Value>, CoreError>;
}

/// Shared, timeout-bounded handle to a document store
#[derive(Clone)]
pub struct Reader {
    store: Arc<dyn DocumentStore>,
    options: ReadOptions,
}

impl Reader {
    pub fn new(store: Arc<dyn DocumentStore>, options: ReadOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    pub async fn find(
        &self,
        collection: &str,
        query: &FindQuery,
    ) -> Result<Vec<Document>, CoreError> {
        let operation = format!("find {}", collection);
        let fut = self.store.find(collection, query, &self.options);
        let docs = self.bounded(&operation, fut).await?;
        debug!(collection, count = docs.len(), limit = ?query.limit, "find complete");
        Ok(docs)
    }

    pub async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, CoreError> {
        let operation = format!("distinct {}.{}", collection, field);
        let fut = self.store.distinct(collection, field, filter, &self.options);
        let values = self.bounded(&operation, fut).await?;
        debug!(collection, field, count = values.len(), "distinct complete");
        Ok(values)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        match tokio::time::timeout(self.options.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.options.timeout.as_millis() as u64;
                warn!(operation, timeout_ms, "Datastore operation timed out");
                Err(CoreError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_in_clause_is_representation_strict() {
        let hex = "65a1f0c2e4b0a1b2c3d4e5f6";
        let stored = doc(json!({"creator": {"$oid": hex}}));

        let text_only = Filter::new().ids("creator", &[IdValue::Text(hex.to_string())]);
        assert!(!text_only.matches(&stored));

        let expanded = Filter::new().ids("creator", &IdValue::expand(hex));
        assert!(expanded.matches(&stored));
    }

    #[test]
    fn test_time_range_clause() {
        let range = DateRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let filter = Filter::new().time_range("createdAt", range);
        assert!(filter.matches(&doc(json!({"createdAt": "2024-01-10T00:00:00Z"}))));
        assert!(!filter.matches(&doc(json!({"createdAt": "2024-02-10T00:00:00Z"}))));
        assert!(!filter.matches(&doc(json!({"other": 1}))));
    }

    #[test]
    fn test_seek_clause_ascending_and_descending() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let seek = |order| {
            Filter::new().push(Clause::Seek {
                time_field: "createdAt".to_string(),
                id_field: "_id".to_string(),
                at,
                id: "m2".to_string(),
                order,
            })
        };
        let same_time_later_id = doc(json!({"_id": "m3", "createdAt": "2024-01-01T12:00:00Z"}));
        let same_time_earlier_id = doc(json!({"_id": "m1", "createdAt": "2024-01-01T12:00:00Z"}));

        assert!(seek(SortOrder::Asc).matches(&same_time_later_id));
        assert!(!seek(SortOrder::Asc).matches(&same_time_earlier_id));
        assert!(seek(SortOrder::Desc).matches(&same_time_earlier_id));
    }

    #[test]
    fn test_exists_clause() {
        let filter = Filter::new().exists("model", true);
        assert!(filter.matches(&doc(json!({"model": "gpt-4o"}))));
        assert!(!filter.matches(&doc(json!({"model": null}))));
    }
}
