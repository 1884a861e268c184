//! turnledger-core - Core library for turnledger
//!
//! Reconciles raw chat, usage and bot-response documents into report rows,
//! and runs scatter-gather batch workflows over customer populations.

pub mod config;
pub mod error;
pub mod feedback;
pub mod matching;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod schema;
pub mod scope;
pub mod store;
pub mod turns;

pub use config::ReconConfig;
pub use error::{CoreError, ErrorKind};
pub use orchestrator::{BatchRequest, BatchResponse, BatchStatus, Orchestrator};
pub use planner::{month_windows, ChunkOptions, ExecutionPlan, Task};
pub use report::{ReportAssembler, ReportRequest};
pub use scope::{CollectionDirectory, PartnerDirectory, ScopeSelector, StaticDirectory};
pub use store::{DocumentStore, MemoryStore, Reader};
