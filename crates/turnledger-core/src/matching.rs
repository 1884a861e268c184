//! Tiered usage and model attribution
//!
//! A turn's reference time is its answer time (question time when
//! unanswered). Usage on the same channel is matched in two tiers:
//!
//! - **direct**: within the match window on either side, closest wins
//! - **nearby**: at or before the reference time, within the nearby window
//!
//! A usage record is charged to one turn at most. Turns must be attributed
//! in ascending time order; a record claimed by an earlier turn is invisible
//! to later ones, so turns sharing an answer are not charged twice.
//!
//! Without a usage match the model may still come from the answer message
//! or the channel's model timeline (`fallback`); otherwise `unmatched`.

use crate::models::{round2, round3, ChannelId, MatchSource, ModelTimeline, UsageRecord};
use crate::turns::Turn;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

pub const UNKNOWN_MODEL: &str = "unknown";

const ANSWER_MODEL_CONFIDENCE: f64 = 1.0;
const DIRECT_USAGE_CONFIDENCE: f64 = 0.92;
const NEARBY_USAGE_CONFIDENCE: f64 = 0.80;
const TIMELINE_CONFIDENCE: f64 = 0.65;

/// Result of attributing one turn
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub model: String,
    pub model_confidence: f64,
    pub credit: f64,
    pub match_source: MatchSource,
}

/// A usage record and its position in the input slice
type Indexed<'a> = (usize, &'a UsageRecord);

/// Matches turns against usage records and the model timeline
pub struct UsageMatcher<'a> {
    by_channel: HashMap<&'a ChannelId, Vec<Indexed<'a>>>,
    /// Input positions already charged to a turn
    claimed: HashSet<usize>,
    timeline: &'a ModelTimeline,
    match_window: Duration,
    nearby_window: Duration,
}

impl<'a> UsageMatcher<'a> {
    /// `match_window_sec` is expected already clamped to the allowed range
    pub fn new(
        usages: &'a [UsageRecord],
        timeline: &'a ModelTimeline,
        match_window_sec: u64,
        nearby_window_sec: i64,
    ) -> Self {
        let mut by_channel: HashMap<&ChannelId, Vec<Indexed>> = HashMap::new();
        for (idx, usage) in usages.iter().enumerate() {
            by_channel.entry(&usage.channel_id).or_default().push((idx, usage));
        }
        for records in by_channel.values_mut() {
            records.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        }

        Self {
            by_channel,
            claimed: HashSet::new(),
            timeline,
            match_window: Duration::seconds(match_window_sec as i64),
            nearby_window: Duration::seconds(nearby_window_sec.max(0)),
        }
    }

    /// Attribute one turn, claiming the usage record it is charged with
    pub fn attribute(&mut self, turn: &Turn) -> Attribution {
        let at = turn.reference_time();
        let channel = turn.channel_id();
        let answer_model = turn.answer.as_ref().and_then(|a| a.model.clone());

        let usage_match = self
            .direct(channel, at)
            .map(|u| (u, MatchSource::Direct, DIRECT_USAGE_CONFIDENCE))
            .or_else(|| {
                self.nearby(channel, at)
                    .map(|u| (u, MatchSource::Nearby, NEARBY_USAGE_CONFIDENCE))
            });

        if let Some(((idx, usage), source, usage_confidence)) = usage_match {
            self.claimed.insert(idx);
            let (model, confidence) = match (answer_model, &usage.model) {
                (Some(m), _) => (m, ANSWER_MODEL_CONFIDENCE),
                (None, Some(m)) => (m.clone(), usage_confidence),
                (None, None) => self
                    .from_timeline(channel, at)
                    .unwrap_or_else(|| (UNKNOWN_MODEL.to_string(), 0.0)),
            };
            return Attribution {
                model,
                model_confidence: round2(confidence),
                credit: round3(usage.amount),
                match_source: source,
            };
        }

        let inferred = answer_model
            .map(|m| (m, ANSWER_MODEL_CONFIDENCE))
            .or_else(|| self.from_timeline(channel, at));

        match inferred {
            Some((model, confidence)) => Attribution {
                model,
                model_confidence: round2(confidence),
                credit: 0.0,
                match_source: MatchSource::Fallback,
            },
            None => Attribution {
                model: UNKNOWN_MODEL.to_string(),
                model_confidence: 0.0,
                credit: 0.0,
                match_source: MatchSource::Unmatched,
            },
        }
    }

    fn records(&self, channel: &ChannelId) -> &[Indexed<'a>] {
        self.by_channel
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Closest unclaimed usage within the window on either side; earlier wins a tie
    fn direct(&self, channel: &ChannelId, at: DateTime<Utc>) -> Option<Indexed<'a>> {
        let mut best: Option<(Indexed<'a>, Duration)> = None;
        for &(idx, usage) in self.records(channel) {
            if self.claimed.contains(&idx) {
                continue;
            }
            let diff = (usage.created_at - at).abs();
            if diff > self.match_window {
                continue;
            }
            if best.map_or(true, |(_, d)| diff < d) {
                best = Some(((idx, usage), diff));
            }
        }
        best.map(|(u, _)| u)
    }

    /// Latest unclaimed usage at or before `at` within the nearby window
    fn nearby(&self, channel: &ChannelId, at: DateTime<Utc>) -> Option<Indexed<'a>> {
        let records = self.records(channel);
        let end = records.partition_point(|(_, u)| u.created_at <= at);
        records[..end]
            .iter()
            .rev()
            .take_while(|(_, u)| at - u.created_at <= self.nearby_window)
            .find(|(idx, _)| !self.claimed.contains(idx))
            .copied()
    }

    fn from_timeline(&self, channel: &ChannelId, at: DateTime<Utc>) -> Option<(String, f64)> {
        self.timeline
            .latest_at_or_before(channel, at)
            .map(|entry| (entry.model.clone(), TIMELINE_CONFIDENCE))
    }
}
