//! Like/dislike extraction from heterogeneous feedback fields
//!
//! Producers record feedback under many shapes: booleans, signed numbers,
//! free-form strings, or a small nested object. The resolver probes a fixed,
//! weighted list of field paths (answer document first, then question
//! document) and returns the first one that yields a signal.

use crate::models::{round2, Feedback};
use crate::store::value::get_path;
use crate::store::Document;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

/// Which side of a turn a probe reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    Answer,
    Question,
}

/// One `(field path, weight)` extractor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackProbe {
    pub target: ProbeTarget,
    pub path: &'static str,
    pub weight: f64,
}

const fn probe(target: ProbeTarget, path: &'static str, weight: f64) -> FeedbackProbe {
    FeedbackProbe {
        target,
        path,
        weight,
    }
}

/// Probe order; first signal wins
pub static FEEDBACK_PROBES: &[FeedbackProbe] = &[
    probe(ProbeTarget::Answer, "feedback", 0.95),
    probe(ProbeTarget::Answer, "reaction", 0.90),
    probe(ProbeTarget::Answer, "rating", 0.85),
    probe(ProbeTarget::Answer, "meta.feedback", 0.80),
    probe(ProbeTarget::Question, "feedback", 0.70),
    probe(ProbeTarget::Question, "reaction", 0.65),
    probe(ProbeTarget::Question, "rating", 0.60),
    probe(ProbeTarget::Question, "meta.feedback", 0.55),
];

/// Localized output tokens some producers store verbatim
pub const LOCALIZED_LIKE: &str = "좋아요";
pub const LOCALIZED_DISLIKE: &str = "싫어요";

static LIKE_TOKENS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "like",
        "liked",
        "up",
        "thumbs_up",
        "thumbsup",
        "positive",
        "good",
        "helpful",
        "yes",
        "true",
        "👍",
        LOCALIZED_LIKE,
    ]
    .into_iter()
    .collect()
});

static DISLIKE_TOKENS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "dislike",
        "disliked",
        "down",
        "thumbs_down",
        "thumbsdown",
        "negative",
        "bad",
        "unhelpful",
        "no",
        "👎",
        LOCALIZED_DISLIKE,
    ]
    .into_iter()
    .collect()
});

/// Keys inspected inside a nested feedback object
const NESTED_KEYS: &[&str] = &["like", "dislike", "status", "value", "type", "sentiment"];

/// Resolved feedback for one turn
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeedbackSignal {
    pub value: Option<Feedback>,
    pub confidence: f64,
}

/// Interpret a scalar value as a signal
fn interpret_scalar(value: &Value) -> Option<Feedback> {
    match value {
        Value::Bool(true) => Some(Feedback::Like),
        Value::Number(n) => {
            let v = n.as_f64()?;
            if v > 0.0 {
                Some(Feedback::Like)
            } else if v < 0.0 {
                Some(Feedback::Dislike)
            } else {
                None
            }
        }
        Value::String(s) => {
            let token = s.trim().to_lowercase();
            if token.is_empty() {
                None
            } else if LIKE_TOKENS.contains(token.as_str()) {
                Some(Feedback::Like)
            } else if DISLIKE_TOKENS.contains(token.as_str()) {
                Some(Feedback::Dislike)
            } else {
                token.parse::<f64>().ok().and_then(|v| {
                    interpret_scalar(&Value::from(v))
                })
            }
        }
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v > 0.0),
        Value::String(s) => {
            let token = s.trim().to_lowercase();
            token == "true" || token == "1" || token == "yes"
        }
        _ => false,
    }
}

/// Interpret any value, descending one level into objects
pub fn interpret_signal(value: &Value) -> Option<Feedback> {
    let Value::Object(map) = value else {
        return interpret_scalar(value);
    };
    NESTED_KEYS.iter().find_map(|key| {
        let inner = map.get(*key)?;
        match *key {
            "like" => is_truthy(inner).then_some(Feedback::Like),
            "dislike" => is_truthy(inner).then_some(Feedback::Dislike),
            _ => interpret_scalar(inner),
        }
    })
}

/// Probes feedback fields over a turn's documents
#[derive(Debug, Clone)]
pub struct FeedbackResolver {
    probes: &'static [FeedbackProbe],
}

impl Default for FeedbackResolver {
    fn default() -> Self {
        Self {
            probes: FEEDBACK_PROBES,
        }
    }
}

impl FeedbackResolver {
    pub fn resolve(&self, question: &Document, answer: Option<&Document>) -> FeedbackSignal {
        for probe in self.probes {
            let doc = match probe.target {
                ProbeTarget::Answer => match answer {
                    Some(doc) => doc,
                    None => continue,
                },
                ProbeTarget::Question => question,
            };
            if let Some(value) = get_path(doc, probe.path).and_then(interpret_signal) {
                return FeedbackSignal {
                    value: Some(value),
                    confidence: round2(probe.weight),
                };
            }
        }
        FeedbackSignal::default()
    }
}
