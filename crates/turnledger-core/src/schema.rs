//! Per-log-type field catalog and filter sanitization
//!
//! Caller-supplied filters are untrusted. [`sanitize_filters`] rejects any
//! key the schema does not list (including `$`-prefixed operator keys) and
//! any value that is not a scalar or list of scalars; [`build_filters`]
//! turns what survives into store clauses on catalog fields only.

use crate::error::CoreError;
use crate::models::IdValue;
use crate::store::{Clause, Filter};
use serde_json::Value;
use std::collections::BTreeMap;

/// Datastore document id
pub const ID_FIELD: &str = "_id";
/// Message and usage creator
pub const CREATOR_FIELD: &str = "creator";
pub const CHANNEL_FIELD: &str = "channel";
pub const SESSION_FIELD: &str = "session";
pub const TIMESTAMP_FIELD: &str = "createdAt";

/// Kinds of log documents the core reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    Chat,
    Usage,
    BotResponse,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Chat => "chat",
            LogType::Usage => "usage",
            LogType::BotResponse => "bot_response",
        }
    }
}

/// How a filter value is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Identifier: matched in every stored representation
    Id,
    /// Plain text equality
    Text,
}

/// A permitted filter key and the document field it maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterKey {
    pub key: &'static str,
    pub field: &'static str,
    pub kind: FilterKind,
}

/// Field catalog for one log type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSchema {
    pub log_type: LogType,
    pub customer_field: Option<&'static str>,
    pub timestamp_field: &'static str,
    pub channel_field: &'static str,
    pub filter_keys: Vec<FilterKey>,
}

impl LogSchema {
    pub fn chat() -> Self {
        Self {
            log_type: LogType::Chat,
            customer_field: Some(CREATOR_FIELD),
            timestamp_field: TIMESTAMP_FIELD,
            channel_field: CHANNEL_FIELD,
            filter_keys: vec![
                FilterKey { key: "channel", field: CHANNEL_FIELD, kind: FilterKind::Id },
                FilterKey { key: "session", field: SESSION_FIELD, kind: FilterKind::Id },
                FilterKey { key: "role", field: "role", kind: FilterKind::Text },
                FilterKey { key: "model", field: "model", kind: FilterKind::Text },
            ],
        }
    }

    pub fn usage() -> Self {
        Self {
            log_type: LogType::Usage,
            customer_field: Some(CREATOR_FIELD),
            timestamp_field: TIMESTAMP_FIELD,
            channel_field: CHANNEL_FIELD,
            filter_keys: vec![
                FilterKey { key: "channel", field: CHANNEL_FIELD, kind: FilterKind::Id },
                FilterKey { key: "model", field: "model", kind: FilterKind::Text },
            ],
        }
    }

    pub fn bot_response() -> Self {
        Self {
            log_type: LogType::BotResponse,
            customer_field: None,
            timestamp_field: TIMESTAMP_FIELD,
            channel_field: CHANNEL_FIELD,
            filter_keys: vec![FilterKey { key: "channel", field: CHANNEL_FIELD, kind: FilterKind::Id }],
        }
    }

    pub fn filter_key(&self, key: &str) -> Option<&FilterKey> {
        self.filter_keys.iter().find(|k| k.key == key)
    }

    pub fn allows(&self, key: &str) -> bool {
        self.filter_key(key).is_some()
    }
}

/// Catalog of all known schemas
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    schemas: Vec<LogSchema>,
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self {
            schemas: vec![LogSchema::chat(), LogSchema::usage(), LogSchema::bot_response()],
        }
    }
}

impl SchemaCatalog {
    pub fn get(&self, log_type: LogType) -> &LogSchema {
        self.schemas
            .iter()
            .find(|s| s.log_type == log_type)
            .unwrap_or(&self.schemas[0])
    }
}

/// Filters that passed schema validation: key -> non-empty scalar list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizedFilters {
    values: BTreeMap<String, Vec<Value>>,
}

impl SanitizedFilters {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&[Value]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// Text values of a key, ignoring non-text scalars
    pub fn texts(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Store a key's values; an empty list drops the key
    fn set(&mut self, key: &str, values: Vec<Value>) {
        if values.is_empty() {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_string(), values);
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Validate raw filters against a schema
pub fn sanitize_filters(
    schema: &LogSchema,
    raw: &BTreeMap<String, Value>,
) -> Result<SanitizedFilters, CoreError> {
    let mut out = SanitizedFilters::default();

    for (key, value) in raw {
        if key.starts_with('$') || !schema.allows(key) {
            return Err(CoreError::UnknownFilterKey {
                key: key.clone(),
                log_type: schema.log_type.as_str().to_string(),
            });
        }

        let values: Vec<Value> = match value {
            Value::Null => Vec::new(),
            Value::Array(items) => {
                if let Some(bad) = items.iter().find(|v| !is_scalar(v)) {
                    return Err(CoreError::invalid_request(format!(
                        "Filter '{}' contains a non-scalar value: {}",
                        key, bad
                    )));
                }
                items.clone()
            }
            v if is_scalar(v) => vec![v.clone()],
            other => {
                return Err(CoreError::invalid_request(format!(
                    "Filter '{}' must be a scalar or a list of scalars, got {}",
                    key, other
                )));
            }
        };

        let values: Vec<Value> = values
            .into_iter()
            .filter(|v| !matches!(v, Value::String(s) if s.trim().is_empty()))
            .collect();
        out.set(key, values);
    }

    Ok(out)
}

/// Turn sanitized filters into store clauses on catalog fields
///
/// Keys the schema does not list are skipped.
pub fn build_filters(schema: &LogSchema, filters: &SanitizedFilters) -> Filter {
    let mut filter = Filter::new();
    for key in filters.keys() {
        let Some(spec) = schema.filter_key(key) else {
            continue;
        };
        filter = match spec.kind {
            FilterKind::Id => {
                let texts = filters.texts(key);
                let forms = IdValue::expand_all(texts.iter().map(String::as_str));
                filter.ids(spec.field, &forms)
            }
            FilterKind::Text => filter.push(Clause::In {
                field: spec.field.to_string(),
                values: filters.get(key).map(<[Value]>::to_vec).unwrap_or_default(),
            }),
        };
    }
    filter
}
