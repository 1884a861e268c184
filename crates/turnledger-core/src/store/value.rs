//! Polymorphic field access over raw documents
//!
//! Documents are schema-ambiguous: timestamps may be RFC 3339 strings,
//! extended-JSON `$date` wrappers or epoch milliseconds; amounts may be
//! numbers, numeric strings or `$numberDecimal`. Everything here returns
//! `None` instead of failing.

use super::Document;
use crate::models::IdValue;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Resolve a dotted path (`meta.feedback.value`) inside a document
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// First present, non-null value among candidate paths
pub fn first_present<'a>(doc: &'a Document, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|p| get_path(doc, p))
        .find(|v| !v.is_null())
}

/// Interpret a value as a UTC timestamp
pub fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => {
            if let Some(inner) = map.get("$date") {
                return as_datetime(inner);
            }
            map.get("$numberLong")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        }
        _ => None,
    }
}

/// Interpret a value as a float (numbers, numeric strings, decimal wrappers)
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Object(map) => ["$numberDecimal", "$numberDouble", "$numberLong", "$numberInt"]
            .iter()
            .find_map(|k| map.get(*k))
            .and_then(as_f64),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// Interpret a value as non-empty trimmed text
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty text among candidate paths
pub fn first_text(doc: &Document, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .filter_map(|p| get_path(doc, p))
        .find_map(as_text)
}

/// Total ordering used by sorts and range filters
///
/// Timestamps compare chronologically, numbers numerically, structured ids
/// by their canonical text, everything else by its JSON text. Missing values
/// sort first.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (as_datetime(a), as_datetime(b)) {
                return x.cmp(&y);
            }
            if let (Value::Number(x), Value::Number(y)) = (a, b) {
                if let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) {
                    return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
                }
            }
            if a.is_object() || b.is_object() {
                if let (Some(x), Some(y)) = (IdValue::from_value(a), IdValue::from_value(b)) {
                    return x.canonical().cmp(&y.canonical());
                }
            }
            match (a, b) {
                (Value::String(x), Value::String(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            }
        }
    }
}
