//! Chat message model
//!
//! A [`Message`] is read from a raw chat document. The fields reports query
//! by (id, channel, session, creator, timestamp) are read under their
//! catalog names only, so a document is either found and parsed or neither.
//! Descriptive fields vary across producers and are probed over a short list
//! of candidates. Documents without a channel, session, creator or timestamp
//! do not produce a message at all.

use super::ids::{ChannelId, IdValue, SessionId};
use crate::schema::{CHANNEL_FIELD, CREATOR_FIELD, ID_FIELD, SESSION_FIELD, TIMESTAMP_FIELD};
use crate::store::value::{as_datetime, first_text};
use crate::store::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ROLE_FIELDS: &[&str] = &["role", "creatorType", "creatorRole", "sender"];
const TEXT_FIELDS: &[&str] = &["text", "message", "content", "question", "answer"];
const MODEL_FIELDS: &[&str] = &["model", "modelName", "model_name", "llm", "meta.model"];

/// Role tags that mark question-like and answer-like messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSets {
    pub question: Vec<String>,
    pub answer: Vec<String>,
}

impl Default for RoleSets {
    fn default() -> Self {
        Self {
            question: ["user", "customer", "human", "question"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            answer: ["assistant", "bot", "ai", "answer", "agent"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RoleSets {
    /// Classify a role tag (case-insensitive)
    pub fn classify(&self, tag: Option<&str>) -> CreatorRole {
        let Some(tag) = tag.map(|t| t.trim().to_lowercase()) else {
            return CreatorRole::Other;
        };
        if self.question.iter().any(|q| q.eq_ignore_ascii_case(&tag)) {
            CreatorRole::Question
        } else if self.answer.iter().any(|a| a.eq_ignore_ascii_case(&tag)) {
            CreatorRole::Answer
        } else {
            CreatorRole::Other
        }
    }
}

/// Role inferred from a message's role tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CreatorRole {
    Question,
    Answer,
    #[default]
    Other,
}

/// One chat event
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub creator: IdValue,
    pub creator_role: CreatorRole,
    pub role_tag: Option<String>,
    pub channel_id: ChannelId,
    pub session_id: SessionId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Model named directly on the message, if any
    pub model: Option<String>,
    /// Source document, kept for feedback probing
    pub raw: Document,
}

impl Message {
    /// Build from a raw chat document; `None` when the document is malformed
    pub fn from_document(doc: &Document, roles: &RoleSets) -> Option<Self> {
        let channel = doc.get(CHANNEL_FIELD).and_then(IdValue::from_value)?;
        let session = doc.get(SESSION_FIELD).and_then(IdValue::from_value)?;
        let creator = doc.get(CREATOR_FIELD).and_then(IdValue::from_value)?;
        let created_at = doc.get(TIMESTAMP_FIELD).and_then(as_datetime)?;

        // stored documents always carry an id; the fallback covers detached ones
        let id = doc
            .get(ID_FIELD)
            .and_then(IdValue::from_value)
            .map(|v| v.canonical())
            .unwrap_or_else(|| {
                format!("{}:{}:{}", channel, session, created_at.timestamp_millis())
            });

        let role_tag = first_text(doc, ROLE_FIELDS);
        let creator_role = roles.classify(role_tag.as_deref());

        Some(Self {
            id,
            creator,
            creator_role,
            role_tag,
            channel_id: ChannelId::from(&channel),
            session_id: SessionId::from(&session),
            text: first_text(doc, TEXT_FIELDS).unwrap_or_default(),
            created_at,
            model: first_text(doc, MODEL_FIELDS),
            raw: doc.clone(),
        })
    }

    pub fn is_answer_like(&self) -> bool {
        self.creator_role == CreatorRole::Answer
    }

    /// Question-like by role tag, or created by one of the target customer's id forms
    ///
    /// An answer role tag always wins over the creator match.
    pub fn is_question_like(&self, customer_forms: &[IdValue]) -> bool {
        match self.creator_role {
            CreatorRole::Question => true,
            CreatorRole::Answer => false,
            CreatorRole::Other => self.creator.matches_any(customer_forms),
        }
    }
}
