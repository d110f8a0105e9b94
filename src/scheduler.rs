//! Concurrency Scheduler: fans a batch of cases out over a bounded number
//! of in-flight requests.
//!
//! Admission is a semaphore the executor holds around each network
//! attempt. Prompt rendering, response parsing, and inter-attempt backoff
//! waits never occupy a slot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::case::{Case, CaseResult};
use crate::executor::{RequestExecutor, FAILURE_SENTINEL};
use crate::gateway::ChatProvider;
use crate::parser;
use crate::prompts::PromptSet;

/// Shared completion counter for one batch, read by progress logging.
pub struct BatchProgress {
    completed: AtomicUsize,
    total: usize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            total,
        }
    }

    /// Record one finished case and return the running count.
    pub fn record(&self) -> usize {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Runs one batch of cases concurrently against a shared executor.
pub struct Scheduler<P: ChatProvider> {
    executor: Arc<RequestExecutor<P>>,
    prompts: PromptSet,
    gate: Arc<Semaphore>,
}

impl<P: ChatProvider> Scheduler<P> {
    pub fn new(executor: Arc<RequestExecutor<P>>, prompts: PromptSet, max_concurrent: usize) -> Self {
        Self {
            executor,
            prompts,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Process every case in the batch, yielding exactly one result per
    /// case in input order. Individual failures never abort the batch:
    /// exhausted cases carry the failure sentinel with `failed` set.
    ///
    /// A raised cancel flag stops the admission of cases that have not yet
    /// acquired a slot; cases already in flight run to completion.
    pub async fn process_batch(
        &self,
        cases: &[Case],
        batch_id: usize,
        cancel: &AtomicBool,
    ) -> Vec<CaseResult> {
        let progress = BatchProgress::new(cases.len());

        let tasks = cases.iter().map(|case| {
            let progress = &progress;
            async move {
                let result = self.process_case(case, cancel).await;
                let done = progress.record();
                debug!(batch_id, case_id = %case.id, done, total = progress.total(), "progress");
                if done % 10 == 0 || done == progress.total() {
                    info!(batch_id, done, total = progress.total(), "batch progress");
                }
                result
            }
        });

        join_all(tasks).await
    }

    async fn process_case(&self, case: &Case, cancel: &AtomicBool) -> CaseResult {
        if cancel.load(Ordering::Relaxed) {
            debug!(case_id = %case.id, "skipping case, cancellation requested");
            return self.build_result(case, FAILURE_SENTINEL.to_string(), true);
        }

        let (system, user) = self.prompts.render(&case.text);
        let outcome = self
            .executor
            .execute_gated(&system, &user, &case.id, &self.gate)
            .await;
        self.build_result(case, outcome.raw_text, outcome.failed)
    }

    fn build_result(&self, case: &Case, raw_text: String, failed: bool) -> CaseResult {
        let (predicted_codes, reasoning) = parser::extract_codes(&raw_text);
        CaseResult {
            id: case.id.clone(),
            text: case.text.clone(),
            expected_codes: case.expected_codes.clone(),
            origin_ids: case.origin_ids.clone(),
            predicted_codes,
            reasoning,
            raw_response: raw_text,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            failed,
        }
    }
}
