//! Scatter-gather batch workflow
//!
//! Resolves a scope, plans tasks, runs them on a small worker pool and
//! merges the rows.
//!
//! Workers pull task indices from a shared atomic cursor over a
//! pre-materialized task slice, so every task is assigned exactly once.
//! Each task drains its report pages; a failure walks the per-task state
//! machine
//!
//! ```text
//! Pending -> Running -> Success
//!                    -> RetryScheduled(delay) -> Running
//!                    -> Failed(attempts)
//! ```
//!
//! Rows are merged into a map keyed by [`RowKey`], so replays never
//! duplicate a row. Once `row_limit` rows are held, later rows are dropped
//! and `has_more` is set.

use crate::config::{ReconConfig, MAX_ROW_LIMIT};
use crate::error::CoreError;
use crate::models::{DateRange, ReportRow, RowKey, SortOrder};
use crate::planner::{
    ChunkOptions, ChunkPlanner, ExecutionPlan, ResolvedOptions, Task, TaskTemplate,
};
use crate::report::ReportAssembler;
use crate::scope::{PartnerDirectory, Scope, ScopeResolver, ScopeSelector};
use crate::store::Reader;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Input of [`Orchestrator::run_batch_workflow`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub scope: ScopeSelector,
    pub date_range: DateRange,
    #[serde(default)]
    pub chunk_options: ChunkOptions,
    #[serde(default)]
    pub row_limit: Option<usize>,
    #[serde(default)]
    pub include_total: bool,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub match_window_sec: Option<u64>,
}

impl BatchRequest {
    pub fn for_partner(partner_id: impl Into<String>, date_range: DateRange) -> Self {
        Self::new(ScopeSelector::Partner(partner_id.into()), date_range)
    }

    pub fn for_customers<C, H>(customers: C, channels: H, date_range: DateRange) -> Self
    where
        C: IntoIterator,
        C::Item: Into<crate::models::CustomerId>,
        H: IntoIterator,
        H::Item: Into<crate::models::ChannelId>,
    {
        Self::new(
            ScopeSelector::Explicit {
                customers: customers.into_iter().map(Into::into).collect(),
                channels: channels.into_iter().map(Into::into).collect(),
            },
            date_range,
        )
    }

    fn new(scope: ScopeSelector, date_range: DateRange) -> Self {
        Self {
            scope,
            date_range,
            chunk_options: ChunkOptions::default(),
            row_limit: None,
            include_total: false,
            sort_order: SortOrder::Asc,
            filters: BTreeMap::new(),
            match_window_sec: None,
        }
    }

    pub fn with_chunk_options(mut self, options: ChunkOptions) -> Self {
        self.chunk_options = options;
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn with_total(mut self, include_total: bool) -> Self {
        self.include_total = include_total;
        self
    }

    pub fn with_sort_order(mut self, order: SortOrder) -> Self {
        self.sort_order = order;
        self
    }

    /// Add a caller filter applied to every task
    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }

    pub fn with_match_window(mut self, seconds: u64) -> Self {
        self.match_window_sec = Some(seconds);
        self
    }
}

/// Outcome classification of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Partial,
    Failed,
}

impl BatchStatus {
    fn classify(rows: usize, failed_chunks: usize) -> Self {
        match (failed_chunks, rows) {
            (0, _) => BatchStatus::Success,
            (_, 0) => BatchStatus::Failed,
            _ => BatchStatus::Partial,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

/// A task that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedChunk {
    pub chunk_id: String,
    pub attempts: u32,
    pub reason: String,
}

/// Observability block of a batch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub member_count: usize,
    pub processed_chunks: usize,
    pub skipped_chunks: usize,
    pub failed_chunks: Vec<FailedChunk>,
    pub elapsed_ms: u64,
    pub execution_plan: ExecutionPlan,
    pub status: BatchStatus,
}

/// Result of [`Orchestrator::run_batch_workflow`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub rows: Vec<ReportRow>,
    pub page_size: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    pub meta: BatchMeta,
}

/// Per-task retry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running { attempt: u32 },
    Success,
    RetryScheduled { next_attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

impl TaskState {
    /// Transition after attempt `attempt` (1-based) failed with `error`
    pub fn after_failure(
        attempt: u32,
        error: &CoreError,
        max_retries: u32,
        retry_base: Duration,
    ) -> Self {
        if error.is_retryable() && attempt <= max_retries {
            TaskState::RetryScheduled {
                next_attempt: attempt + 1,
                delay: retry_base * attempt,
            }
        } else {
            TaskState::Failed { attempts: attempt }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed { .. })
    }
}

/// Shared accumulator across workers
#[derive(Debug, Default)]
pub struct MergeState {
    rows: HashMap<RowKey, ReportRow>,
    seen: HashSet<RowKey>,
    has_more: bool,
    processed: usize,
    skipped: usize,
    failed: Vec<FailedChunk>,
}

impl MergeState {
    /// Merge rows under the cap; replaying the same rows changes nothing
    pub fn merge(&mut self, rows: Vec<ReportRow>, row_limit: usize) {
        for row in rows {
            let key = row.row_key();
            self.seen.insert(key.clone());
            if self.rows.contains_key(&key) {
                continue;
            }
            if self.rows.len() >= row_limit {
                self.has_more = true;
                continue;
            }
            self.rows.insert(key, row);
        }
    }

    pub fn is_full(&self, row_limit: usize) -> bool {
        self.rows.len() >= row_limit
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows sorted by `(occurredAt, rowKey)`
    fn into_sorted_rows(self, order: SortOrder) -> Vec<ReportRow> {
        let mut rows: Vec<(RowKey, ReportRow)> = self.rows.into_iter().collect();
        rows.sort_by(|a, b| {
            order.apply(
                a.0.cmp(&b.0)
                    .then_with(|| a.1.question_id.cmp(&b.1.question_id)),
            )
        });
        rows.into_iter().map(|(_, row)| row).collect()
    }
}

/// Everything a worker needs, cloned per worker
#[derive(Clone)]
struct Worker {
    assembler: ReportAssembler,
    tasks: Arc<[Task]>,
    cursor: Arc<AtomicUsize>,
    state: Arc<Mutex<MergeState>>,
    options: ResolvedOptions,
    row_limit: usize,
    include_total: bool,
}

impl Worker {
    async fn run(self, worker_id: usize) {
        loop {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(task) = self.tasks.get(idx) else {
                break;
            };

            if !self.include_total {
                let mut state = self.state.lock();
                if state.is_full(self.row_limit) {
                    state.skipped += 1;
                    state.has_more = true;
                    debug!(worker_id, chunk_id = %task.chunk_id, "Row cap reached, skipping task");
                    continue;
                }
            }

            let span = info_span!("task", chunk_id = %task.chunk_id, worker_id);
            let outcome = self.execute(task).instrument(span).await;

            {
                let mut state = self.state.lock();
                state.processed += 1;
                match outcome {
                    Ok(rows) => state.merge(rows, self.row_limit),
                    Err(failed) => state.failed.push(failed),
                }
            }

            sleep(Duration::from_millis(self.options.pause_ms)).await;
        }
        debug!(worker_id, "Worker finished");
    }

    /// Run one task through the retry state machine
    async fn execute(&self, task: &Task) -> Result<Vec<ReportRow>, FailedChunk> {
        let retry_base = Duration::from_millis(self.options.retry_base_ms);
        let mut state = TaskState::Pending;
        let mut rows = Vec::new();
        let mut last_error: Option<CoreError> = None;

        loop {
            state = match state {
                TaskState::Pending => TaskState::Running { attempt: 1 },
                TaskState::Running { attempt } => match self.drain(task).await {
                    Ok(drained) => {
                        rows = drained;
                        TaskState::Success
                    }
                    Err(e) => {
                        let next =
                            TaskState::after_failure(attempt, &e, self.options.max_retries, retry_base);
                        warn!(attempt, error = %e, retryable = e.is_retryable(), "Task attempt failed");
                        last_error = Some(e);
                        next
                    }
                },
                TaskState::RetryScheduled {
                    next_attempt,
                    delay,
                } => {
                    debug!(next_attempt, delay_ms = delay.as_millis() as u64, "Retrying task");
                    sleep(delay).await;
                    TaskState::Running {
                        attempt: next_attempt,
                    }
                }
                TaskState::Success => return Ok(rows),
                TaskState::Failed { attempts } => {
                    let reason = last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown failure".to_string());
                    warn!(attempts, reason = %reason, "Task failed after retries");
                    return Err(FailedChunk {
                        chunk_id: task.chunk_id.clone(),
                        attempts,
                        reason,
                    });
                }
            };
        }
    }

    /// Page through one task until it is exhausted or the cap is reached
    async fn drain(&self, task: &Task) -> Result<Vec<ReportRow>, CoreError> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let request = task.request.clone().with_cursor(cursor.take());
            let page = self.assembler.build_report(&request).await?;
            rows.extend(page.rows);

            if !page.has_more {
                break;
            }
            if !self.include_total && self.state.lock().len() + rows.len() >= self.row_limit {
                // more data exists than the cap will take
                self.state.lock().has_more = true;
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    // rows remain that this task cannot reach
                    warn!(rows = rows.len(), "Page has more rows but no cursor");
                    self.state.lock().has_more = true;
                    break;
                }
            }
        }

        debug!(rows = rows.len(), "Task drained");
        Ok(rows)
    }
}

/// Runs batch workflows over one store
#[derive(Clone)]
pub struct Orchestrator {
    assembler: ReportAssembler,
    scope: ScopeResolver,
    config: Arc<ReconConfig>,
}

impl Orchestrator {
    pub fn new(
        reader: Reader,
        directory: Arc<dyn PartnerDirectory>,
        config: Arc<ReconConfig>,
    ) -> Self {
        let scope = ScopeResolver::new(
            reader.clone(),
            directory,
            config.collections.chats.clone(),
        );
        Self {
            assembler: ReportAssembler::new(reader, config.clone()),
            scope,
            config,
        }
    }

    pub fn assembler(&self) -> &ReportAssembler {
        &self.assembler
    }

    fn row_limit(&self, request: &BatchRequest) -> usize {
        request
            .row_limit
            .unwrap_or(self.config.batch.row_limit)
            .clamp(1, MAX_ROW_LIMIT)
    }

    fn planner(&self, request: &BatchRequest) -> ChunkPlanner {
        ChunkPlanner::new(
            request.chunk_options.resolve(&self.config.batch),
            TaskTemplate {
                filters: request.filters.clone(),
                match_window_sec: request.match_window_sec,
            },
        )
    }

    /// Resolve scope and build tasks without running them
    pub async fn plan(
        &self,
        request: &BatchRequest,
    ) -> Result<(Scope, Vec<Task>, ExecutionPlan), CoreError> {
        request.date_range.validate()?;
        let scope = self.scope.resolve(&request.scope, &request.date_range).await?;
        let (tasks, plan) = self.planner(request).plan(&scope, &request.date_range);
        Ok((scope, tasks, plan))
    }

    pub async fn run_batch_workflow(
        &self,
        request: &BatchRequest,
    ) -> Result<BatchResponse, CoreError> {
        let started = Instant::now();
        let (scope, tasks, plan) = self.plan(request).await?;
        let planner = self.planner(request);
        let options = *planner.options();
        let row_limit = self.row_limit(request);

        info!(
            members = scope.member_count(),
            tasks = tasks.len(),
            windows = plan.window_count,
            workers = options.workers,
            row_limit,
            "Batch workflow started"
        );

        let task_count = tasks.len();
        let state = Arc::new(Mutex::new(MergeState::default()));
        let worker = Worker {
            assembler: self.assembler.clone(),
            tasks: tasks.into(),
            cursor: Arc::new(AtomicUsize::new(0)),
            state: state.clone(),
            options,
            row_limit,
            include_total: request.include_total,
        };

        let mut handles = Vec::with_capacity(options.workers);
        for worker_id in 0..options.workers.min(task_count) {
            handles.push(tokio::spawn(worker.clone().run(worker_id)));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task panicked");
            }
        }
        drop(worker);

        let merged = std::mem::take(&mut *state.lock());
        let processed = merged.processed;
        let skipped = merged.skipped;
        let has_more = merged.has_more;
        let total = request.include_total.then_some(merged.seen.len());
        let failed = merged.failed.clone();
        let rows = merged.into_sorted_rows(request.sort_order);
        let status = BatchStatus::classify(rows.len(), failed.len());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            rows = rows.len(),
            processed,
            skipped,
            failed = failed.len(),
            status = status.as_str(),
            elapsed_ms,
            "Batch workflow finished"
        );

        Ok(BatchResponse {
            rows,
            page_size: row_limit,
            has_more,
            total,
            meta: BatchMeta {
                member_count: scope.member_count(),
                processed_chunks: processed,
                skipped_chunks: skipped,
                failed_chunks: failed,
                elapsed_ms,
                execution_plan: plan,
                status,
            },
        })
    }
}
