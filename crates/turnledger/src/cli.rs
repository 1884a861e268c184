//! Output formatting for report pages, batch responses and plans
//!
//! Every formatter renders either pretty JSON or a comfy-table table.

use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use turnledger_core::models::{ReportPage, ReportRow, ReportSummary};
use turnledger_core::planner::Task;
use turnledger_core::scope::Scope;
use turnledger_core::{BatchResponse, ExecutionPlan};

// ============================================================================
// Formatters
// ============================================================================

/// Format one report page (human or JSON)
pub fn format_report_page(page: &ReportPage, json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(page).unwrap_or_else(|_| "{}".to_string());
    }

    if page.rows.is_empty() {
        return "No turns found.".to_string();
    }

    let mut lines = vec![rows_table(&page.rows), String::new()];
    lines.extend(summary_lines(&page.summary));
    if let Some(cursor) = &page.next_cursor {
        lines.push(format!("Next cursor:      {}", cursor));
    }
    lines.join("\n")
}

/// Format a batch response (human or JSON)
pub fn format_batch_response(response: &BatchResponse, json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(response).unwrap_or_else(|_| "{}".to_string());
    }

    let mut lines = vec![];
    if response.rows.is_empty() {
        lines.push("No turns found.".to_string());
    } else {
        lines.push(rows_table(&response.rows));
    }
    lines.push(String::new());

    let meta = &response.meta;
    lines.push(format!("Status:           {}", meta.status.as_str()));
    lines.push(format!("Members:          {}", meta.member_count));
    lines.push(format!(
        "Chunks:           {} processed, {} skipped, {} failed",
        meta.processed_chunks,
        meta.skipped_chunks,
        meta.failed_chunks.len()
    ));
    if let Some(total) = response.total {
        lines.push(format!("Total rows:       {}", total));
    }
    if response.has_more {
        lines.push(format!(
            "Row limit:        {} (more rows available)",
            response.page_size
        ));
    }
    for failed in &meta.failed_chunks {
        lines.push(format!(
            "  ✗ {} after {} attempts: {}",
            failed.chunk_id, failed.attempts, failed.reason
        ));
    }
    lines.join("\n")
}

/// Format a batch plan (human or JSON)
pub fn format_plan(scope: &Scope, tasks: &[Task], plan: &ExecutionPlan, json: bool) -> String {
    if json {
        let value = serde_json::json!({
            "scope": scope,
            "executionPlan": plan,
            "chunks": tasks.iter().map(|t| &t.chunk_id).collect::<Vec<_>>(),
        });
        return serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    }

    let mut lines = vec![
        format!("Members:          {}", scope.member_count()),
        format!("Pinned channels:  {}", scope.channel_count()),
        format!("Month windows:    {}", plan.window_count),
        format!(
            "Customer batches: {} (size {})",
            plan.customer_batch_count, plan.customer_batch_size
        ),
        format!("Channel chunk:    {}", plan.channel_chunk_size),
        format!("Workers:          {}", plan.workers),
        format!("Max retries:      {}", plan.max_retries),
        format!("Tasks:            {}", tasks.len()),
    ];

    if !tasks.is_empty() {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Chunk").fg(Color::Cyan),
            Cell::new("Customer").fg(Color::Cyan),
            Cell::new("Channels").fg(Color::Cyan),
            Cell::new("Window").fg(Color::Cyan),
        ]);
        for task in tasks {
            let channels = if task.channel_ids.is_empty() {
                "all".to_string()
            } else {
                task.channel_ids.len().to_string()
            };
            let window = format!(
                "{} .. {}",
                task.request.date_range.start.format("%Y-%m-%d"),
                task.request.date_range.end.format("%Y-%m-%d")
            );
            table.add_row(Row::from(vec![
                task.chunk_id.clone(),
                task.customer_id.to_string(),
                channels,
                window,
            ]));
        }
        lines.push(String::new());
        lines.push(table.to_string());
    }
    lines.join("\n")
}

fn rows_table(rows: &[ReportRow]) -> String {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Time").fg(Color::Cyan),
        Cell::new("Channel").fg(Color::Cyan),
        Cell::new("Session").fg(Color::Cyan),
        Cell::new("Question").fg(Color::Cyan),
        Cell::new("Answer").fg(Color::Cyan),
        Cell::new("Model").fg(Color::Cyan),
        Cell::new("Credit").fg(Color::Cyan),
        Cell::new("Session Σ").fg(Color::Cyan),
        Cell::new("Match").fg(Color::Cyan),
        Cell::new("Feedback").fg(Color::Cyan),
    ]);

    for row in rows {
        table.add_row(Row::from(vec![
            row.occurred_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.channel_id.to_string(),
            truncate(row.session_id.as_str(), 12),
            truncate(&row.question, 40),
            row.answer
                .as_deref()
                .map(|a| truncate(a, 40))
                .unwrap_or_else(|| "-".to_string()),
            format!("{} ({:.2})", row.model, row.model_confidence),
            format!("{:.3}", row.credit_used),
            format!("{:.3}", row.session_credit_total),
            row.match_source.as_str().to_string(),
            row.feedback
                .map(|f| f.as_str().to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]));
    }

    table.to_string()
}

fn summary_lines(summary: &ReportSummary) -> Vec<String> {
    vec![
        format!("Rows:             {}", summary.total_rows),
        format!("Answered:         {}", summary.answered_count),
        format!("Credit used:      {:.3}", summary.total_credit_used),
        format!(
            "Matches:          {} direct, {} nearby, {} fallback, {} unmatched",
            summary.direct_count,
            summary.nearby_count,
            summary.fallback_count,
            summary.unmatched_count
        ),
        format!(
            "Feedback:         {} like, {} dislike",
            summary.like_count, summary.dislike_count
        ),
    ]
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
