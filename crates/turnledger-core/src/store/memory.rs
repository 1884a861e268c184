//! In-memory document store
//!
//! DashMap keyed by collection name, one `Vec<Document>` per collection.
//! Used by the CLI over fixture directories and by tests, which can inject
//! failures and latency to exercise retries and timeouts.

use super::value::{compare_values, get_path};
use super::{Document, DocumentStore, Filter, FindQuery, ReadOptions};
use crate::error::CoreError;
use crate::schema::ID_FIELD;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, trace};

type FailurePredicate = Box<dyn Fn(&str, &Filter) -> bool + Send + Sync>;

/// Thread-safe in-memory store
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, Vec<Document>>,
    /// Remaining operations that fail unconditionally
    fail_budget: AtomicUsize,
    /// Operations matching this predicate always fail
    fail_when: RwLock<Option<FailurePredicate>>,
    latency: RwLock<Option<Duration>>,
    /// Sequence behind generated document ids
    next_id: AtomicU64,
    find_calls: AtomicUsize,
    distinct_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document; one without an `_id` gets a generated structured id
    pub fn insert(&self, collection: &str, mut doc: Document) {
        if doc.get(ID_FIELD).map_or(true, Value::is_null) {
            let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            doc.insert(ID_FIELD.to_string(), json!({ "$oid": format!("{:024x}", seq) }));
        }
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
    }

    /// Insert a JSON object; non-objects are ignored
    pub fn insert_value(&self, collection: &str, value: Value) {
        if let Value::Object(doc) = value {
            self.insert(collection, doc);
        }
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.iter().all(|c| c.value().is_empty())
    }

    /// Fail the next `n` operations with an upstream read error
    pub fn fail_next(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Fail every operation for which the predicate holds
    pub fn fail_when(&self, predicate: impl Fn(&str, &Filter) -> bool + Send + Sync + 'static) {
        *self.fail_when.write() = Some(Box::new(predicate));
    }

    /// Delay every operation
    pub fn with_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn distinct_calls(&self) -> usize {
        self.distinct_calls.load(Ordering::SeqCst)
    }

    /// Load every `<collection>.jsonl` file in a directory
    ///
    /// Malformed lines and non-object lines are skipped.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, CoreError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CoreError::FixtureRead {
                path: dir.to_path_buf(),
                source: e,
            })?;

        let mut total = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| CoreError::FixtureRead {
            path: dir.to_path_buf(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                total += self.load_jsonl(&path).await?;
            }
        }

        debug!(path = %dir.display(), documents = total, "Fixture directory loaded");
        Ok(total)
    }

    /// Load one JSONL file into the collection named by its file stem
    pub async fn load_jsonl(&self, path: &Path) -> Result<usize, CoreError> {
        let collection = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_string();

        let file = File::open(path).await.map_err(|e| CoreError::FixtureRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut line_number = 0;
        let mut loaded = 0;

        while let Some(line) = lines.next_line().await.map_err(|e| CoreError::FixtureRead {
            path: path.to_path_buf(),
            source: e,
        })? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(doc)) => {
                    self.insert(&collection, doc);
                    loaded += 1;
                }
                Ok(_) => {
                    trace!(path = %path.display(), line = line_number, "Skipping non-object line");
                }
                Err(e) => {
                    trace!(
                        path = %path.display(),
                        line = line_number,
                        error = %e,
                        "Skipping malformed JSONL line"
                    );
                }
            }
        }

        debug!(collection, loaded, "Fixture file loaded");
        Ok(loaded)
    }

    async fn before_operation(
        &self,
        operation: &str,
        collection: &str,
        filter: &Filter,
    ) -> Result<(), CoreError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let budget_hit = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let predicate_hit = self
            .fail_when
            .read()
            .as_ref()
            .map(|p| p(collection, filter))
            .unwrap_or(false);

        if budget_hit || predicate_hit {
            return Err(CoreError::upstream(
                format!("{} {}", operation, collection),
                "injected failure",
            ));
        }
        Ok(())
    }
}

fn project(doc: &Document, fields: &[String]) -> Document {
    let mut out = Document::new();
    if let Some(id) = doc.get(ID_FIELD) {
        out.insert(ID_FIELD.to_string(), id.clone());
    }
    for field in fields {
        let top = field.split('.').next().unwrap_or(field);
        if let Some(v) = doc.get(top) {
            out.insert(top.to_string(), v.clone());
        }
    }
    out
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(
        &self,
        collection: &str,
        query: &FindQuery,
        _options: &ReadOptions,
    ) -> Result<Vec<Document>, CoreError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.before_operation("find", collection, &query.filter)
            .await?;

        let mut matched: Vec<Document> = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| query.filter.matches(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !query.sort.is_empty() {
            matched.sort_by(|a, b| {
                query
                    .sort
                    .iter()
                    .map(|key| {
                        key.order.apply(compare_values(
                            get_path(a, &key.field),
                            get_path(b, &key.field),
                        ))
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        if let Some(ref fields) = query.projection {
            matched = matched.iter().map(|d| project(d, fields)).collect();
        }

        Ok(matched)
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
        _options: &ReadOptions,
    ) -> Result<Vec<Value>, CoreError> {
        self.distinct_calls.fetch_add(1, Ordering::SeqCst);
        self.before_operation("distinct", collection, filter).await?;

        let mut out: Vec<Value> = Vec::new();
        if let Some(docs) = self.collections.get(collection) {
            for doc in docs.iter().filter(|d| filter.matches(d)) {
                let values = match get_path(doc, field) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Null) | None => continue,
                    Some(v) => vec![v.clone()],
                };
                for v in values {
                    if !out.contains(&v) {
                        out.push(v);
                    }
                }
            }
        }
        Ok(out)
    }
}
