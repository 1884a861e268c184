//! Turn building: pair each question with the answer that follows it
//!
//! Messages are grouped per (channel, session) and ordered by time. For
//! every question-like message the first later answer-like message in the
//! same session becomes its answer.

use crate::models::{ChannelId, CustomerId, IdValue, Message, RoleSets, SessionId, SortOrder};
use crate::store::Document;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::trace;

/// One question and its best-matching answer
#[derive(Debug, Clone)]
pub struct Turn {
    pub question: Message,
    pub answer: Option<Message>,
}

impl Turn {
    /// Time attribution is anchored on: the answer, else the question
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.answer
            .as_ref()
            .map(|a| a.created_at)
            .unwrap_or(self.question.created_at)
    }

    /// Milliseconds from question to answer; `None` without an answer
    pub fn latency_ms(&self) -> Option<i64> {
        self.answer
            .as_ref()
            .map(|a| (a.created_at - self.question.created_at).num_milliseconds())
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.question.channel_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.question.session_id
    }

    /// Stable tie-break between turns asked at the same instant
    fn cmp_key(&self, other: &Turn) -> Ordering {
        let q = &self.question;
        let o = &other.question;
        q.created_at
            .cmp(&o.created_at)
            .then_with(|| q.channel_id.cmp(&o.channel_id))
            .then_with(|| q.session_id.cmp(&o.session_id))
            .then_with(|| q.creator.canonical().cmp(&o.creator.canonical()))
            .then_with(|| q.text.cmp(&o.text))
            .then_with(|| q.id.cmp(&o.id))
    }
}

/// Parse raw chat documents, dropping malformed ones
pub fn messages_from_documents(docs: &[Document], roles: &RoleSets) -> Vec<Message> {
    let mut dropped = 0usize;
    let messages: Vec<Message> = docs
        .iter()
        .filter_map(|doc| {
            let msg = Message::from_document(doc, roles);
            if msg.is_none() {
                dropped += 1;
            }
            msg
        })
        .collect();
    if dropped > 0 {
        trace!(dropped, kept = messages.len(), "Dropped malformed chat documents");
    }
    messages
}

/// Builds turns for one target customer
#[derive(Debug, Clone)]
pub struct TurnBuilder {
    customer_forms: Vec<IdValue>,
    order: SortOrder,
}

impl TurnBuilder {
    pub fn new(customer: &CustomerId) -> Self {
        Self {
            customer_forms: customer.forms(),
            order: SortOrder::Asc,
        }
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Build turns from messages of any number of sessions
    pub fn build(&self, messages: Vec<Message>) -> Vec<Turn> {
        let mut sessions: BTreeMap<(ChannelId, SessionId), Vec<Message>> = BTreeMap::new();
        for msg in messages {
            sessions
                .entry((msg.channel_id.clone(), msg.session_id.clone()))
                .or_default()
                .push(msg);
        }

        let mut turns = Vec::new();
        for (_, mut session) in sessions {
            session.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

            for (idx, msg) in session.iter().enumerate() {
                if !msg.is_question_like(&self.customer_forms) {
                    continue;
                }
                let answer = session[idx + 1..]
                    .iter()
                    .find(|m| m.is_answer_like() && m.created_at >= msg.created_at)
                    .cloned();
                turns.push(Turn {
                    question: msg.clone(),
                    answer,
                });
            }
        }

        turns.sort_by(|a, b| self.order.apply(a.cmp_key(b)));
        turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn msg(id: &str, session: &str, role: &str, creator: &str, secs: i64) -> Document {
        let at = Utc.timestamp_opt(1_705_312_800 + secs, 0).unwrap();
        json!({
            "_id": id,
            "creator": creator,
            "role": role,
            "channel": "ch",
            "session": session,
            "text": format!("text {}", id),
            "createdAt": at.to_rfc3339(),
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn build(docs: &[Document], order: SortOrder) -> Vec<Turn> {
        let messages = messages_from_documents(docs, &RoleSets::default());
        TurnBuilder::new(&CustomerId::from("cust"))
            .with_order(order)
            .build(messages)
    }

    #[test]
    fn test_pairs_question_with_following_answer() {
        let docs = vec![
            msg("q1", "s1", "user", "cust", 0),
            msg("a1", "s1", "assistant", "bot", 5),
            msg("q2", "s1", "user", "cust", 10),
            msg("a2", "s1", "assistant", "bot", 12),
        ];
        let turns = build(&docs, SortOrder::Asc);

        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question.id, "q1");
        assert_eq!(turns[0].answer.as_ref().unwrap().id, "a1");
        assert_eq!(turns[1].answer.as_ref().unwrap().id, "a2");
        assert_eq!(turns[0].latency_ms(), Some(5_000));
    }

    #[test]
    fn test_unanswered_question_has_no_latency() {
        let docs = vec![msg("q1", "s1", "user", "cust", 0)];
        let turns = build(&docs, SortOrder::Asc);
        assert_eq!(turns.len(), 1);
        assert!(turns[0].answer.is_none());
        assert_eq!(turns[0].latency_ms(), None);
        assert_eq!(turns[0].reference_time(), turns[0].question.created_at);
    }

    #[test]
    fn test_answers_never_cross_sessions() {
        let docs = vec![
            msg("q1", "s1", "user", "cust", 0),
            msg("a-other", "s2", "assistant", "bot", 5),
        ];
        let turns = build(&docs, SortOrder::Asc);
        assert!(turns[0].answer.is_none());
    }

    #[test]
    fn test_earlier_answer_not_paired() {
        let docs = vec![
            msg("a0", "s1", "assistant", "bot", 0),
            msg("q1", "s1", "user", "cust", 10),
        ];
        let turns = build(&docs, SortOrder::Asc);
        assert_eq!(turns.len(), 1);
        assert!(turns[0].answer.is_none());
    }

    #[test]
    fn test_customer_creator_counts_as_question() {
        let docs = vec![
            msg("q1", "s1", "note", "cust", 0),
            msg("x1", "s1", "note", "someone", 1),
            msg("a1", "s1", "bot", "bot", 2),
        ];
        let turns = build(&docs, SortOrder::Asc);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].question.id, "q1");
        assert_eq!(turns[0].answer.as_ref().unwrap().id, "a1");
    }

    #[test]
    fn test_malformed_messages_dropped() {
        let mut broken = msg("q2", "s1", "user", "cust", 3);
        broken.remove("channel");
        let docs = vec![msg("q1", "s1", "user", "cust", 0), broken];
        let turns = build(&docs, SortOrder::Asc);
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn test_descending_order_and_nonnegative_latency() {
        let docs = vec![
            msg("q1", "s1", "user", "cust", 0),
            msg("a1", "s1", "assistant", "bot", 3),
            msg("q2", "s2", "user", "cust", 20),
            msg("a2", "s2", "assistant", "bot", 30),
        ];
        let turns = build(&docs, SortOrder::Desc);
        assert_eq!(turns[0].question.id, "q2");
        assert_eq!(turns[1].question.id, "q1");
        assert!(turns.iter().all(|t| t.latency_ms().unwrap_or(0) >= 0));
    }

    #[test]
    fn test_simultaneous_questions_use_stable_tie_break() {
        let docs = vec![
            msg("qb", "s2", "user", "cust", 0),
            msg("qa", "s1", "user", "cust", 0),
        ];
        let turns = build(&docs, SortOrder::Asc);
        assert_eq!(turns[0].question.id, "qa");
        assert_eq!(turns[1].question.id, "qb");
    }
}
