//! Report rows and summaries

use super::ids::{ChannelId, CustomerId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tier at which usage/model attribution was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    /// Usage within the strict match window of the answer
    Direct,
    /// Usage shortly before the answer
    Nearby,
    /// No usage; model inferred without a usage record
    Fallback,
    /// No signal at all
    Unmatched,
}

impl MatchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchSource::Direct => "direct",
            MatchSource::Nearby => "nearby",
            MatchSource::Fallback => "fallback",
            MatchSource::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Like/dislike signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Like,
    Dislike,
}

impl Feedback {
    pub fn as_str(self) -> &'static str {
        match self {
            Feedback::Like => "like",
            Feedback::Dislike => "dislike",
        }
    }
}

/// Stable identity of a row across tasks: `(occurredAt, channel, session, customer, question)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub occurred_at: DateTime<Utc>,
    pub channel_id: ChannelId,
    pub session_id: SessionId,
    pub customer_id: CustomerId,
    pub question: String,
}

/// One reconciled question/answer turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub occurred_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub response_latency_ms: Option<i64>,
    pub channel_id: ChannelId,
    pub session_id: SessionId,
    pub customer_id: CustomerId,
    pub question_id: String,
    pub answer_id: Option<String>,
    pub question: String,
    pub answer: Option<String>,
    pub model: String,
    pub model_confidence: f64,
    pub credit_used: f64,
    pub session_credit_total: f64,
    pub match_source: MatchSource,
    pub feedback: Option<Feedback>,
    pub feedback_confidence: f64,
}

impl ReportRow {
    pub fn row_key(&self) -> RowKey {
        RowKey {
            occurred_at: self.occurred_at,
            channel_id: self.channel_id.clone(),
            session_id: self.session_id.clone(),
            customer_id: self.customer_id.clone(),
            question: self.question.clone(),
        }
    }
}

/// Aggregate counters over a set of rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_rows: usize,
    pub total_credit_used: f64,
    pub fallback_count: usize,
    pub unmatched_count: usize,
    pub direct_count: usize,
    pub nearby_count: usize,
    pub answered_count: usize,
    pub like_count: usize,
    pub dislike_count: usize,
}

impl ReportSummary {
    pub fn from_rows(rows: &[ReportRow]) -> Self {
        let mut summary = Self::default();
        for row in rows {
            summary.record(row);
        }
        summary
    }

    pub fn record(&mut self, row: &ReportRow) {
        self.total_rows += 1;
        self.total_credit_used = round3(self.total_credit_used + row.credit_used);
        match row.match_source {
            MatchSource::Direct => self.direct_count += 1,
            MatchSource::Nearby => self.nearby_count += 1,
            MatchSource::Fallback => self.fallback_count += 1,
            MatchSource::Unmatched => self.unmatched_count += 1,
        }
        if row.answer.is_some() {
            self.answered_count += 1;
        }
        match row.feedback {
            Some(Feedback::Like) => self.like_count += 1,
            Some(Feedback::Dislike) => self.dislike_count += 1,
            None => {}
        }
    }
}

/// One page of a single-customer report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPage {
    pub rows: Vec<ReportRow>,
    pub summary: ReportSummary,
    pub page_size: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Round to 3 decimals (credits)
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Round to 2 decimals (confidences)
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
