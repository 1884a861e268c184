//! turnledger - Reconciled conversation reports

mod cli;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use turnledger_core::models::{DateRange, SortOrder};
use turnledger_core::{
    BatchRequest, ChunkOptions, CollectionDirectory, MemoryStore, Orchestrator, Reader,
    ReconConfig, ReportAssembler, ReportRequest,
};

#[derive(Parser)]
#[command(
    name = "turnledger",
    version,
    about = "Reconciled conversation reports from raw chat, usage and bot-response documents",
    long_about = "Pairs customer questions with bot answers, attributes credit usage and model\n\
                  to each turn, and runs chunked batch workflows across many customers.\n\
                  \n\
                  Documents are read from a fixture directory of <collection>.jsonl files\n\
                  (chats.jsonl, usages.jsonl, botresponses.jsonl, customers.jsonl).\n\
                  \n\
                  Examples:\n\
                    turnledger -f data report cust-1 --start 2024-03-01 --end 2024-03-31\n\
                    turnledger -f data report cust-1 --start 2024-03-01 --end 2024-03-31 --channel web\n\
                    turnledger -f data batch --partner p1 --start 2024-01-01 --end 2024-03-31\n\
                    turnledger -f data batch --customer c1 --customer c2 --start 2024-01-01 --end 2024-01-31\n\
                    turnledger -f data plan --partner p1 --start 2024-01-01 --end 2024-06-30\n\
                  \n\
                  Environment Variables:\n\
                    TURNLEDGER_FIXTURES              # Fixture directory\n\
                    TURNLEDGER_CONFIG                # TOML configuration file\n\
                    TURNLEDGER_FORMAT                # Force output format: json|table\n\
                    RUST_LOG                         # Log filter (default: turnledger=info)"
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Directory of <collection>.jsonl fixture files
    #[arg(long, short = 'f', env = "TURNLEDGER_FIXTURES")]
    fixtures: PathBuf,

    /// TOML configuration file
    #[arg(long, env = "TURNLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Force output format (json|table)
    #[arg(long, env = "TURNLEDGER_FORMAT", value_parser = ["json", "table"])]
    format: Option<String>,

    /// Debug-level logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(clap::Args)]
struct RangeArgs {
    /// Range start: YYYY-MM-DD or RFC 3339
    #[arg(long)]
    start: String,
    /// Range end (inclusive day or RFC 3339 instant)
    #[arg(long)]
    end: String,
}

#[derive(clap::Args)]
struct ScopeArgs {
    /// Partner whose member customers form the scope
    #[arg(long, conflicts_with = "customers")]
    partner: Option<String>,
    /// Explicit customer id (repeatable)
    #[arg(long = "customer", required_unless_present = "partner")]
    customers: Vec<String>,
    /// Channel id applied to every explicit customer (repeatable)
    #[arg(long = "channel", requires = "customers")]
    channels: Vec<String>,
    /// Concurrent workers
    #[arg(long)]
    workers: Option<usize>,
    /// Retries per failed chunk
    #[arg(long)]
    max_retries: Option<u32>,
    /// Customers per batch
    #[arg(long)]
    customer_batch_size: Option<usize>,
    /// Channels per chunk
    #[arg(long)]
    channel_chunk_size: Option<usize>,
}

#[derive(Subcommand)]
enum Mode {
    /// Build one report page for a single customer
    Report {
        /// Customer id (text or 24-hex object id)
        customer: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Restrict to channel (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// Rows per page
        #[arg(long, short = 'n')]
        page_size: Option<usize>,
        /// Row order (asc|desc)
        #[arg(long, default_value = "asc", value_parser = ["asc", "desc"])]
        sort: String,
        /// Direct-match window in seconds
        #[arg(long)]
        match_window: Option<u64>,
        /// Continue after a previous page's nextCursor
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Run a chunked batch workflow across a customer population
    Batch {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        scope: ScopeArgs,
        /// Global row cap
        #[arg(long)]
        row_limit: Option<usize>,
        /// Keep counting rows past the cap
        #[arg(long)]
        include_total: bool,
        /// Row order (asc|desc)
        #[arg(long, default_value = "asc", value_parser = ["asc", "desc"])]
        sort: String,
    },
    /// Print the execution plan of a batch without running it
    Plan {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = ReconConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let json = cli.format.as_deref() == Some("json");

    match cli.mode {
        Mode::Report {
            customer,
            range,
            channels,
            page_size,
            sort,
            match_window,
            cursor,
        } => {
            let mut request = ReportRequest::new(customer, parse_range(&range)?)
                .with_sort_order(parse_sort(&sort)?)
                .with_cursor(cursor);
            if !channels.is_empty() {
                request = request.with_filter("channel", Value::from(channels));
            }
            if let Some(size) = page_size {
                request = request.with_page_size(size);
            }
            if let Some(window) = match_window {
                request = request.with_match_window(window);
            }
            run_report(&cli.fixtures, config, request, json).await?;
        }
        Mode::Batch {
            range,
            scope,
            row_limit,
            include_total,
            sort,
        } => {
            let mut request = batch_request(&scope, parse_range(&range)?)
                .with_total(include_total)
                .with_sort_order(parse_sort(&sort)?);
            if let Some(limit) = row_limit {
                request = request.with_row_limit(limit);
            }
            run_batch(&cli.fixtures, config, request, json).await?;
        }
        Mode::Plan { range, scope } => {
            let request = batch_request(&scope, parse_range(&range)?);
            run_plan(&cli.fixtures, config, request, json).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable
fn init_logging(verbose: bool) {
    let default = if verbose {
        "turnledger=debug,turnledger_core=debug"
    } else {
        "turnledger=info,turnledger_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_range(args: &RangeArgs) -> Result<DateRange> {
    DateRange::parse(&args.start, &args.end)
        .with_context(|| format!("Invalid date range {} .. {}", args.start, args.end))
}

fn parse_sort(sort: &str) -> Result<SortOrder> {
    sort.parse::<SortOrder>()
        .with_context(|| format!("Invalid sort order {}", sort))
}

fn batch_request(scope: &ScopeArgs, range: DateRange) -> BatchRequest {
    let request = match &scope.partner {
        Some(partner) => BatchRequest::for_partner(partner.clone(), range),
        None => BatchRequest::for_customers(
            scope.customers.iter().map(String::as_str),
            scope.channels.iter().map(String::as_str),
            range,
        ),
    };
    request.with_chunk_options(ChunkOptions {
        customer_batch_size: scope.customer_batch_size,
        channel_chunk_size: scope.channel_chunk_size,
        workers: scope.workers,
        max_retries: scope.max_retries,
        ..Default::default()
    })
}

async fn load_store(fixtures: &Path) -> Result<Arc<MemoryStore>> {
    let store = Arc::new(MemoryStore::new());
    let loaded = store
        .load_dir(fixtures)
        .await
        .with_context(|| format!("Failed to load fixtures from {}", fixtures.display()))?;
    tracing::info!(documents = loaded, dir = %fixtures.display(), "fixtures loaded");
    Ok(store)
}

fn orchestrator(store: Arc<MemoryStore>, config: ReconConfig) -> Orchestrator {
    let reader = Reader::new(store, config.read_options());
    let directory = CollectionDirectory::new(reader.clone(), config.collections.customers.clone());
    Orchestrator::new(reader, Arc::new(directory), Arc::new(config))
}

async fn run_report(
    fixtures: &Path,
    config: ReconConfig,
    request: ReportRequest,
    json: bool,
) -> Result<()> {
    let store = load_store(fixtures).await?;
    let reader = Reader::new(store, config.read_options());
    let assembler = ReportAssembler::new(reader, Arc::new(config));

    let page = assembler
        .build_report(&request)
        .await
        .context("Failed to build report")?;

    println!("{}", cli::format_report_page(&page, json));
    Ok(())
}

async fn run_batch(
    fixtures: &Path,
    config: ReconConfig,
    request: BatchRequest,
    json: bool,
) -> Result<()> {
    let store = load_store(fixtures).await?;
    let orchestrator = orchestrator(store, config);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .context("Invalid spinner template")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message("Running batch workflow...");

    let result = orchestrator.run_batch_workflow(&request).await;
    spinner.finish_and_clear();
    let response = result.context("Batch workflow failed")?;

    eprintln!(
        "✓ {} rows in {:.2}s ({} chunks, {} failed, {} skipped)",
        response.rows.len(),
        response.meta.elapsed_ms as f64 / 1000.0,
        response.meta.processed_chunks,
        response.meta.failed_chunks.len(),
        response.meta.skipped_chunks
    );
    println!("{}", cli::format_batch_response(&response, json));
    Ok(())
}

async fn run_plan(
    fixtures: &Path,
    config: ReconConfig,
    request: BatchRequest,
    json: bool,
) -> Result<()> {
    let store = load_store(fixtures).await?;
    let orchestrator = orchestrator(store, config);

    let (scope, tasks, plan) = orchestrator
        .plan(&request)
        .await
        .context("Failed to plan batch")?;

    println!("{}", cli::format_plan(&scope, &tasks, &plan, json));
    Ok(())
}
