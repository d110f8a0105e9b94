#![forbid(unsafe_code)]

//! # triage-harness
//!
//! Batch classification of free-text case records by a remote
//! chat-completion endpoint, built to survive the endpoint's bad days.
//!
//! The pipeline runs in three stages:
//!
//! 1. **Run** — the [`runner::Runner`] chunks the reference case list into
//!    batches, fans each batch out under a concurrency cap, retries
//!    transient failures per request, and persists every batch to its own
//!    JSONL file before starting the next one.
//! 2. **Consolidate** — the [`consolidate::Consolidator`] collapses all
//!    batch files into one record per case id (last file wins), reconciles
//!    against the reference list, and emits the unified and flattened
//!    views.
//! 3. **Triage** — the [`triage::TriageAnalyzer`] classifies every unified
//!    record by response shape and quarantines the ones needing manual
//!    review.
//!
//! No stage ever drops a case: request exhaustion produces a failure
//! sentinel, malformed lines are counted and skipped, and unreadable
//! unified lines surface as `ReadError` records.

pub mod case;
pub mod config;
pub mod consolidate;
pub mod executor;
pub mod gateway;
pub mod parser;
pub mod prompts;
pub mod runner;
pub mod scheduler;
pub mod triage;

pub use case::{Case, CaseResult, ReferenceLine};
pub use config::{ApiConfig, ProcessingConfig};
pub use consolidate::{ConsolidationStats, Consolidator};
pub use executor::{ExecutionOutcome, RequestExecutor, RetryPolicy};
pub use gateway::{ChatProvider, DeepSeekAdapter, ProviderError};
pub use runner::{run_validation, RunReport, RunStatus, Runner};
pub use scheduler::Scheduler;
pub use triage::{FormatClass, TriageAnalyzer, TriageSummary};
