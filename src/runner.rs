//! Batch Orchestrator: loads the reference file, backs up stale outputs,
//! and drives the scheduler one batch at a time, persisting each batch to
//! its own JSONL file before the next one starts.
//!
//! The invariant maintained here is durability per batch: once a batch
//! file exists on disk it is complete, and a cancelled run never leaves a
//! partially written batch behind.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{info, warn};

use crate::case::{Case, ReferenceLine};
use crate::config::ProcessingConfig;
use crate::gateway::ChatProvider;
use crate::scheduler::Scheduler;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every batch was processed and persisted.
    Completed,
    /// The cancel flag was raised; only fully processed batches were kept.
    Cancelled,
    /// The reference file yielded no usable cases.
    NoWork,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize result for case {case_id}: {source}")]
    Serialize {
        case_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("provider setup failed: {0}")]
    Provider(#[from] crate::gateway::ProviderError),
}

fn io_err(path: &Path, source: std::io::Error) -> RunError {
    RunError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Summary of a finished (or interrupted) run.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub cases_total: usize,
    pub cases_processed: usize,
    pub batches_written: usize,
    pub elapsed_secs: f64,
}

/// Drives the full validation run over one reference file.
pub struct Runner<P: ChatProvider> {
    scheduler: Scheduler<P>,
    processing: ProcessingConfig,
    output_dir: PathBuf,
}

impl<P: ChatProvider> Runner<P> {
    pub fn new(
        scheduler: Scheduler<P>,
        processing: ProcessingConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            processing,
            output_dir: output_dir.into(),
        }
    }

    /// Execute the whole run: load, back up, process batch by batch.
    pub async fn run(
        &self,
        reference_path: &Path,
        cancel: &AtomicBool,
    ) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let cases = load_cases(reference_path)?;
        if cases.is_empty() {
            warn!(path = %reference_path.display(), "reference file yielded no cases");
            return Ok(RunReport {
                status: RunStatus::NoWork,
                cases_total: 0,
                cases_processed: 0,
                batches_written: 0,
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        fs::create_dir_all(&self.output_dir).map_err(|e| io_err(&self.output_dir, e))?;
        if let Some(backup_dir) = backup_existing(&self.output_dir)? {
            info!(backup = %backup_dir.display(), "moved previous results aside");
        }

        // Rough planning figure only; actual throughput depends on the
        // endpoint. Assumes ~10s per case at full concurrency.
        let estimate_minutes =
            cases.len() as f64 / (self.processing.max_concurrent.max(1) as f64 * 6.0);
        info!(
            cases = cases.len(),
            batch_size = self.processing.batch_size,
            max_concurrent = self.processing.max_concurrent,
            estimate_minutes = format!("{estimate_minutes:.1}"),
            "starting run"
        );

        let mut status = RunStatus::Completed;
        let mut cases_processed = 0usize;
        let mut batches_written = 0usize;
        // Line buffer reused across batches; trimmed back periodically so a
        // single batch of oversized responses does not pin memory for the
        // rest of the run.
        let mut line_buf: Vec<u8> = Vec::new();

        let batch_size = self.processing.batch_size.max(1);
        for (index, chunk) in cases.chunks(batch_size).enumerate() {
            let batch_id = index + 1;
            if cancel.load(Ordering::Relaxed) {
                status = RunStatus::Cancelled;
                break;
            }

            info!(batch_id, cases = chunk.len(), "processing batch");
            let results = self.scheduler.process_batch(chunk, batch_id, cancel).await;

            if cancel.load(Ordering::Relaxed) {
                // Results from an interrupted batch are discarded; the
                // batches already on disk remain valid.
                warn!(batch_id, "cancelled mid-batch, discarding partial results");
                status = RunStatus::Cancelled;
                break;
            }

            let path = write_batch(&self.output_dir, batch_id, &results, &mut line_buf)?;
            cases_processed += results.len();
            batches_written += 1;
            info!(batch_id, path = %path.display(), "batch persisted");

            if batch_id % self.processing.memory_cleanup_every.max(1) == 0 {
                line_buf.shrink_to(64 * 1024);
            }
        }

        let elapsed_secs = started.elapsed().as_secs_f64();
        let per_minute = if elapsed_secs > 0.0 {
            cases_processed as f64 / (elapsed_secs / 60.0)
        } else {
            0.0
        };
        info!(
            ?status,
            cases_processed,
            batches_written,
            elapsed_secs = format!("{elapsed_secs:.1}"),
            cases_per_minute = format!("{per_minute:.1}"),
            "run finished"
        );

        Ok(RunReport {
            status,
            cases_total: cases.len(),
            cases_processed,
            batches_written,
            elapsed_secs,
        })
    }
}

/// Composed entry point: build the provider from the environment and run
/// the whole validation over `reference_path`, writing batch files into
/// `output_dir`.
pub async fn run_validation(
    reference_path: &Path,
    output_dir: &Path,
    api: crate::config::ApiConfig,
    processing: ProcessingConfig,
    cancel: &AtomicBool,
) -> Result<RunReport, RunError> {
    let provider = crate::gateway::DeepSeekAdapter::from_env()?;
    let max_concurrent = processing.max_concurrent;
    let executor = std::sync::Arc::new(crate::executor::RequestExecutor::new(provider, api));
    let scheduler = Scheduler::new(
        executor,
        crate::prompts::PromptSet::default(),
        max_concurrent,
    );
    Runner::new(scheduler, processing, output_dir)
        .run(reference_path, cancel)
        .await
}

/// Read the reference JSONL, skipping lines that do not parse or carry no
/// id. Tolerance here mirrors the consolidation stage: a bad line costs
/// one case, never the run.
pub fn load_cases(path: &Path) -> Result<Vec<Case>, RunError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let reader = BufReader::new(file);

    let mut cases = Vec::new();
    let mut skipped = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReferenceLine>(&line) {
            Ok(reference) => match reference.into_case() {
                Some(case) => cases.push(case),
                None => {
                    skipped += 1;
                    warn!(line = number + 1, "reference line has no id, skipping");
                }
            },
            Err(err) => {
                skipped += 1;
                warn!(line = number + 1, error = %err, "malformed reference line, skipping");
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, loaded = cases.len(), "reference file had unusable lines");
    }
    Ok(cases)
}

/// Move any `results_*.jsonl` already in `output_dir` into a timestamped
/// backup directory. Returns the backup path when anything was moved.
pub fn backup_existing(output_dir: &Path) -> Result<Option<PathBuf>, RunError> {
    let mut stale = Vec::new();
    for entry in fs::read_dir(output_dir).map_err(|e| io_err(output_dir, e))? {
        let entry = entry.map_err(|e| io_err(output_dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("results_") && name.ends_with(".jsonl") {
            stale.push(entry.path());
        }
    }
    if stale.is_empty() {
        return Ok(None);
    }

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let backup_dir = output_dir.join(format!("backup_{stamp}"));
    fs::create_dir_all(&backup_dir).map_err(|e| io_err(&backup_dir, e))?;
    for path in &stale {
        let target = backup_dir.join(path.file_name().unwrap_or_default());
        fs::rename(path, &target).map_err(|e| io_err(path, e))?;
    }
    info!(moved = stale.len(), backup = %backup_dir.display(), "backed up previous results");
    Ok(Some(backup_dir))
}

/// Persist one batch as `results_batch_{id}_{YYYYmmdd_HHMM}.jsonl`, one
/// record per line. The file appears only after every record is written.
fn write_batch(
    output_dir: &Path,
    batch_id: usize,
    results: &[crate::case::CaseResult],
    line_buf: &mut Vec<u8>,
) -> Result<PathBuf, RunError> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M");
    let path = output_dir.join(format!("results_batch_{batch_id}_{stamp}.jsonl"));

    let file = File::create(&path).map_err(|e| io_err(&path, e))?;
    let mut writer = BufWriter::new(file);
    for result in results {
        line_buf.clear();
        serde_json::to_writer(&mut *line_buf, result).map_err(|e| RunError::Serialize {
            case_id: result.id.clone(),
            source: e,
        })?;
        line_buf.push(b'\n');
        writer.write_all(line_buf).map_err(|e| io_err(&path, e))?;
    }
    writer.flush().map_err(|e| io_err(&path, e))?;
    Ok(path)
}
