//! Chunk planning for batch runs
//!
//! A batch is flattened into independent tasks: calendar-month windows ×
//! customer batches × channel chunks. Every window but the last is
//! end-exclusive, so consecutive windows share a bound without overlapping.

use crate::config::{
    BatchConfig, MAX_CHANNEL_CHUNK, MAX_CUSTOMER_BATCH, MAX_RETRIES, MAX_WORKERS,
};
use crate::models::{ChannelId, CustomerId, DateRange, EndBound, IdValue, SortOrder};
use crate::report::ReportRequest;
use crate::scope::{CustomerScope, Scope};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Caller overrides for decomposition and execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkOptions {
    pub customer_batch_size: Option<usize>,
    pub channel_chunk_size: Option<usize>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub pause_ms: Option<u64>,
}

/// [`ChunkOptions`] merged with configuration defaults and clamped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub customer_batch_size: usize,
    pub channel_chunk_size: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub pause_ms: u64,
    pub retry_base_ms: u64,
    pub task_page_size: usize,
}

impl ChunkOptions {
    pub fn resolve(&self, batch: &BatchConfig) -> ResolvedOptions {
        ResolvedOptions {
            customer_batch_size: self
                .customer_batch_size
                .unwrap_or(batch.customer_batch_size)
                .clamp(1, MAX_CUSTOMER_BATCH),
            channel_chunk_size: self
                .channel_chunk_size
                .unwrap_or(batch.channel_chunk_size)
                .clamp(1, MAX_CHANNEL_CHUNK),
            workers: self.workers.unwrap_or(batch.workers).clamp(1, MAX_WORKERS),
            max_retries: self.max_retries.unwrap_or(batch.max_retries).min(MAX_RETRIES),
            pause_ms: self.pause_ms.unwrap_or(batch.pause_ms),
            retry_base_ms: batch.retry_base_ms,
            task_page_size: batch.task_page_size.max(1),
        }
    }
}

fn next_month_start(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

/// Split a range into calendar-month windows
///
/// Each window is `[cursor, nextMonthStart)`; the final one ends at the
/// range end with the range's own end bound.
pub fn month_windows(range: &DateRange) -> Vec<DateRange> {
    let mut windows = Vec::new();
    let mut cursor = range.start;

    loop {
        let next = next_month_start(cursor);
        let is_last = match (next, range.end_bound) {
            (None, _) => true,
            (Some(next), EndBound::Inclusive) => next > range.end,
            (Some(next), EndBound::Exclusive) => next >= range.end,
        };

        if is_last {
            windows.push(DateRange {
                start: cursor,
                end: range.end,
                end_bound: range.end_bound,
            });
            return windows;
        }

        // `is_last` is false only when `next` exists
        let Some(next) = next else {
            return windows;
        };
        windows.push(DateRange {
            start: cursor,
            end: next,
            end_bound: EndBound::Exclusive,
        });
        cursor = next;
    }
}

/// One unit of orchestrated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// `"<YYYY-MM>/b<batch>/<customer>/<k<chunk>|all>"`
    pub chunk_id: String,
    pub window_index: usize,
    pub batch_index: usize,
    pub customer_id: CustomerId,
    pub channel_ids: Vec<ChannelId>,
    pub request: ReportRequest,
}

/// How a batch was decomposed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub window_count: usize,
    pub customer_batch_count: usize,
    pub customer_batch_size: usize,
    pub channel_chunk_size: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub estimated_tasks: usize,
}

/// Fields copied into every task request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskTemplate {
    pub filters: BTreeMap<String, Value>,
    pub match_window_sec: Option<u64>,
}

impl TaskTemplate {
    /// Canonical channel ids the caller's `channel` filter allows
    ///
    /// `None` when the caller did not restrict channels.
    fn channel_allow_list(&self) -> Option<Vec<String>> {
        let values = match self.filters.get(CHANNEL_FILTER)? {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            Value::Null => return None,
            other => vec![other],
        };
        let allowed: Vec<String> = values
            .into_iter()
            .filter_map(IdValue::from_value)
            .map(|id| id.canonical())
            .collect();
        (!allowed.is_empty()).then_some(allowed)
    }
}

const CHANNEL_FILTER: &str = "channel";

/// Builds the task list for a resolved scope
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    options: ResolvedOptions,
    template: TaskTemplate,
    allowed_channels: Option<Vec<String>>,
}

impl ChunkPlanner {
    pub fn new(options: ResolvedOptions, template: TaskTemplate) -> Self {
        let allowed_channels = template.channel_allow_list();
        Self {
            options,
            template,
            allowed_channels,
        }
    }

    /// Channel chunks of one customer
    ///
    /// Pinned channels are narrowed to the caller's channel filter first. A
    /// customer without pinned channels gets one unrestricted chunk; one whose
    /// pinned channels are all filtered out gets none.
    fn channel_chunks(&self, customer: &CustomerScope) -> Vec<Vec<ChannelId>> {
        if customer.channel_ids.is_empty() {
            return vec![Vec::new()];
        }
        let pinned: Vec<ChannelId> = match &self.allowed_channels {
            Some(allowed) => customer
                .channel_ids
                .iter()
                .filter(|c| {
                    let canonical = IdValue::Text(c.as_str().to_string()).canonical();
                    allowed.contains(&canonical)
                })
                .cloned()
                .collect(),
            None => customer.channel_ids.clone(),
        };
        pinned
            .chunks(self.options.channel_chunk_size)
            .map(<[ChannelId]>::to_vec)
            .collect()
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    /// Describe the decomposition without materializing tasks
    pub fn describe(&self, scope: &Scope, range: &DateRange) -> ExecutionPlan {
        let windows = month_windows(range).len();
        let chunk = self.options.channel_chunk_size;
        let per_window: usize = scope
            .customers
            .iter()
            .map(|c| self.channel_chunks(c).len())
            .sum();

        ExecutionPlan {
            window_count: windows,
            customer_batch_count: scope
                .member_count()
                .div_ceil(self.options.customer_batch_size),
            customer_batch_size: self.options.customer_batch_size,
            channel_chunk_size: chunk,
            workers: self.options.workers,
            max_retries: self.options.max_retries,
            estimated_tasks: windows * per_window,
        }
    }

    pub fn plan(&self, scope: &Scope, range: &DateRange) -> (Vec<Task>, ExecutionPlan) {
        let plan = self.describe(scope, range);
        let mut tasks = Vec::with_capacity(plan.estimated_tasks);

        for (window_index, window) in month_windows(range).into_iter().enumerate() {
            let label = window.start.format("%Y-%m").to_string();
            for (batch_index, batch) in scope
                .customers
                .chunks(self.options.customer_batch_size)
                .enumerate()
            {
                for customer in batch {
                    for (chunk_index, channels) in
                        self.channel_chunks(customer).into_iter().enumerate()
                    {
                        let suffix = if channels.is_empty() {
                            "all".to_string()
                        } else {
                            format!("k{}", chunk_index)
                        };
                        tasks.push(Task {
                            chunk_id: format!(
                                "{}/b{}/{}/{}",
                                label, batch_index, customer.customer_id, suffix
                            ),
                            window_index,
                            batch_index,
                            customer_id: customer.customer_id.clone(),
                            request: self.task_request(
                                &customer.customer_id,
                                window,
                                &channels,
                            ),
                            channel_ids: channels,
                        });
                    }
                }
            }
        }

        (tasks, plan)
    }

    fn task_request(
        &self,
        customer: &CustomerId,
        window: DateRange,
        channels: &[ChannelId],
    ) -> ReportRequest {
        let mut request = ReportRequest::new(customer.clone(), window)
            .with_page_size(self.options.task_page_size)
            .with_sort_order(SortOrder::Asc);
        request.filters = self.template.filters.clone();
        request.match_window_sec = self.template.match_window_sec;
        if !channels.is_empty() {
            request.filters.insert(
                CHANNEL_FILTER.to_string(),
                Value::Array(
                    channels
                        .iter()
                        .map(|c| Value::String(c.as_str().to_string()))
                        .collect(),
                ),
            );
        }
        request
    }
}
