//! Metered usage and the per-channel model timeline

use super::ids::{ChannelId, IdValue};
use crate::schema::{CHANNEL_FIELD, TIMESTAMP_FIELD};
use crate::store::value::{as_datetime, as_f64, first_present, first_text};
use crate::store::Document;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const CREATOR_FIELDS: &[&str] = &["creator", "creatorId", "userId"];
const AMOUNT_FIELDS: &[&str] = &["amount", "credit", "credits", "usage", "cost"];
const MODEL_FIELDS: &[&str] = &[
    "model",
    "modelName",
    "model_name",
    "llm",
    "meta.model",
    "detail.model",
];

/// A metered-usage event
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub channel_id: ChannelId,
    pub creator_id: Option<String>,
    /// Credit units, never negative
    pub amount: f64,
    pub created_at: DateTime<Utc>,
    pub model: Option<String>,
}

impl UsageRecord {
    /// Build from a raw usage document; `None` without channel or timestamp
    pub fn from_document(doc: &Document) -> Option<Self> {
        let channel = doc.get(CHANNEL_FIELD).and_then(IdValue::from_value)?;
        let created_at = doc.get(TIMESTAMP_FIELD).and_then(as_datetime)?;
        let amount = first_present(doc, AMOUNT_FIELDS)
            .and_then(as_f64)
            .map(|a| a.max(0.0))
            .unwrap_or(0.0);

        Some(Self {
            channel_id: ChannelId::from(&channel),
            creator_id: first_present(doc, CREATOR_FIELDS)
                .and_then(IdValue::from_value)
                .map(|v| v.canonical()),
            amount,
            created_at,
            model: first_text(doc, MODEL_FIELDS),
        })
    }
}

/// A model observed on a channel at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTimelineEntry {
    pub channel_id: ChannelId,
    pub at: DateTime<Utc>,
    pub model: String,
}

/// Model observations per channel, sorted ascending by time
#[derive(Debug, Clone, Default)]
pub struct ModelTimeline {
    entries: HashMap<ChannelId, Vec<ModelTimelineEntry>>,
}

impl ModelTimeline {
    /// Build from usage records and raw bot-response documents
    pub fn build(usages: &[UsageRecord], bot_responses: &[Document]) -> Self {
        let mut timeline = Self::default();

        for usage in usages {
            if let Some(ref model) = usage.model {
                timeline.push(ModelTimelineEntry {
                    channel_id: usage.channel_id.clone(),
                    at: usage.created_at,
                    model: model.clone(),
                });
            }
        }

        for doc in bot_responses {
            let channel = doc.get(CHANNEL_FIELD).and_then(IdValue::from_value);
            let at = doc.get(TIMESTAMP_FIELD).and_then(as_datetime);
            let model = first_text(doc, MODEL_FIELDS);
            if let (Some(channel), Some(at), Some(model)) = (channel, at, model) {
                timeline.push(ModelTimelineEntry {
                    channel_id: ChannelId::from(&channel),
                    at,
                    model,
                });
            }
        }

        for entries in timeline.entries.values_mut() {
            entries.sort_by(|a, b| a.at.cmp(&b.at));
        }
        timeline
    }

    fn push(&mut self, entry: ModelTimelineEntry) {
        self.entries
            .entry(entry.channel_id.clone())
            .or_default()
            .push(entry);
    }

    /// Latest entry on the channel at or before `at`
    pub fn latest_at_or_before(
        &self,
        channel: &ChannelId,
        at: DateTime<Utc>,
    ) -> Option<&ModelTimelineEntry> {
        let entries = self.entries.get(channel)?;
        let idx = entries.partition_point(|e| e.at <= at);
        idx.checked_sub(1).map(|i| &entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_usage_amount_coercion() {
        let negative = doc(json!({"channel": "c", "createdAt": "2024-01-15T10:00:00Z", "amount": -3}));
        assert_eq!(UsageRecord::from_document(&negative).unwrap().amount, 0.0);

        let text = doc(json!({"channel": "c", "createdAt": "2024-01-15T10:00:00Z", "credit": "1.25"}));
        assert_eq!(UsageRecord::from_document(&text).unwrap().amount, 1.25);

        let missing = doc(json!({"channel": "c", "createdAt": "2024-01-15T10:00:00Z"}));
        assert_eq!(UsageRecord::from_document(&missing).unwrap().amount, 0.0);
    }

    #[test]
    fn test_usage_model_field_variants() {
        let d = doc(json!({
            "channel": "c", "createdAt": "2024-01-15T10:00:00Z",
            "detail": {"model": "claude-3-haiku"}
        }));
        assert_eq!(
            UsageRecord::from_document(&d).unwrap().model.as_deref(),
            Some("claude-3-haiku")
        );
    }

    #[test]
    fn test_usage_requires_channel_and_time() {
        assert!(UsageRecord::from_document(&doc(json!({"amount": 1}))).is_none());
        // usages are queried by channel and createdAt, so aliases are not read
        let aliased = doc(json!({"channelId": "c", "timestamp": "2024-01-15T10:00:00Z", "amount": 1}));
        assert!(UsageRecord::from_document(&aliased).is_none());
    }

    #[test]
    fn test_timeline_latest_at_or_before() {
        let usages = vec![UsageRecord {
            channel_id: ChannelId::from("c"),
            creator_id: None,
            amount: 1.0,
            created_at: at(10, 0),
            model: Some("model-a".to_string()),
        }];
        let bot = vec![doc(json!({
            "channel": "c", "createdAt": "2024-01-15T11:00:00Z", "modelName": "model-b"
        }))];
        let timeline = ModelTimeline::build(&usages, &bot);
        let channel = ChannelId::from("c");

        assert_eq!(timeline.len(), 2);
        assert!(timeline.latest_at_or_before(&channel, at(9, 59)).is_none());
        assert_eq!(
            timeline.latest_at_or_before(&channel, at(10, 0)).unwrap().model,
            "model-a"
        );
        assert_eq!(
            timeline.latest_at_or_before(&channel, at(12, 0)).unwrap().model,
            "model-b"
        );
        assert!(timeline
            .latest_at_or_before(&ChannelId::from("other"), at(12, 0))
            .is_none());
    }
}
