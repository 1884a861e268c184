//! Reconciliation benchmarks
//!
//! Measures:
//! - turn building over synthetic sessions
//! - usage attribution over those turns
//! - a full `build_report` page against the in-memory store
//!
//! Run with:
//! ```bash
//! cargo bench --bench reconcile_bench
//! ```

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use turnledger_core::matching::UsageMatcher;
use turnledger_core::models::{CustomerId, DateRange, ModelTimeline, RoleSets, UsageRecord};
use turnledger_core::store::{Document, ReadOptions};
use turnledger_core::turns::{messages_from_documents, TurnBuilder};
use turnledger_core::{MemoryStore, Reader, ReconConfig, ReportAssembler, ReportRequest};

/// `sessions` sessions of `turns` question/answer pairs each, plus one usage per answer
fn generate(sessions: usize, turns: usize) -> (Vec<Document>, Vec<Document>) {
    let base = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let mut chats = Vec::with_capacity(sessions * turns * 2);
    let mut usages = Vec::with_capacity(sessions * turns);

    for s in 0..sessions {
        let channel = format!("ch-{}", s % 8);
        for t in 0..turns {
            let at = base + Duration::seconds((s * 3_600 + t * 60) as i64);
            let answer_at = at + Duration::seconds(4);
            let question: Value = json!({
                "_id": format!("q-{}-{}", s, t), "creator": "cust", "role": "user",
                "channel": channel, "session": format!("s-{}", s),
                "text": format!("question {}", t), "createdAt": at.to_rfc3339(),
            });
            let answer: Value = json!({
                "_id": format!("a-{}-{}", s, t), "creator": "bot", "role": "assistant",
                "channel": channel, "session": format!("s-{}", s),
                "text": "answer", "createdAt": answer_at.to_rfc3339(),
            });
            let usage: Value = json!({
                "channel": channel, "amount": 0.125, "model": "gpt-4o-mini",
                "createdAt": (answer_at + Duration::seconds(1)).to_rfc3339(),
            });
            for value in [question, answer] {
                if let Value::Object(doc) = value {
                    chats.push(doc);
                }
            }
            if let Value::Object(doc) = usage {
                usages.push(doc);
            }
        }
    }
    (chats, usages)
}

fn turns_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("turns");
    let roles = RoleSets::default();
    let customer = CustomerId::from("cust");

    for sessions in [10, 100, 500] {
        let (chats, _) = generate(sessions, 10);
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &chats, |b, chats| {
            b.iter(|| {
                let messages = messages_from_documents(black_box(chats), &roles);
                TurnBuilder::new(&customer).build(messages)
            });
        });
    }
    group.finish();
}

fn attribution_benchmark(c: &mut Criterion) {
    let (chats, usage_docs) = generate(200, 10);
    let usages: Vec<UsageRecord> = usage_docs
        .iter()
        .filter_map(UsageRecord::from_document)
        .collect();
    let timeline = ModelTimeline::build(&usages, &[]);
    let turns = TurnBuilder::new(&CustomerId::from("cust"))
        .build(messages_from_documents(&chats, &RoleSets::default()));

    c.bench_function("attribute_2000_turns", |b| {
        b.iter(|| {
            let mut matcher = UsageMatcher::new(&usages, &timeline, 60, 300);
            turns
                .iter()
                .map(|t| matcher.attribute(black_box(t)).credit)
                .sum::<f64>()
        });
    });
}

fn build_report_benchmark(c: &mut Criterion) {
    let (chats, usages) = generate(100, 10);
    let store = Arc::new(MemoryStore::new());
    for doc in chats {
        store.insert("chats", doc);
    }
    for doc in usages {
        store.insert("usages", doc);
    }
    let reader = Reader::new(store, ReadOptions::default());
    let assembler = ReportAssembler::new(reader, Arc::new(ReconConfig::default()));
    let request = ReportRequest::new(
        "cust",
        DateRange::parse("2024-01-15", "2024-01-31").unwrap(),
    )
    .with_page_size(500);

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("build_report_page_500", |b| {
        b.to_async(&rt)
            .iter(|| async { assembler.build_report(&request).await.unwrap().rows.len() });
    });
}

criterion_group!(
    benches,
    turns_benchmark,
    attribution_benchmark,
    build_report_benchmark
);
criterion_main!(benches);
