#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use triage_harness::config::{ApiConfig, ProcessingConfig};
use triage_harness::consolidate::Consolidator;
use triage_harness::runner::{run_validation, RunStatus};
use triage_harness::triage::TriageAnalyzer;

#[derive(Parser)]
#[command(name = "triage", version, about = "Batch classification harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every case in a reference file, batch by batch
    Run {
        /// Reference case file (JSONL)
        reference: PathBuf,
        /// Directory for batch result files
        #[arg(long, default_value = "results")]
        out: PathBuf,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Merge batch files into unified and flattened views
    Consolidate {
        /// Directory holding the batch files
        #[arg(long, default_value = "results")]
        batches: PathBuf,
        /// Reference case file (JSONL)
        #[arg(long)]
        reference: PathBuf,
        /// Directory for the consolidated outputs
        #[arg(long, default_value = "results")]
        out: PathBuf,
    },
    /// Classify unified records by response shape and quarantine the bad ones
    Triage {
        /// Unified results file
        #[arg(long)]
        unified: PathBuf,
        /// Directory for the errors/ subdirectory
        #[arg(long, default_value = "results")]
        out: PathBuf,
    },
    /// Run, consolidate, and triage in one go
    Pipeline {
        /// Reference case file (JSONL)
        reference: PathBuf,
        /// Working directory for all outputs
        #[arg(long, default_value = "results")]
        out: PathBuf,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

fn build_configs(
    model: Option<String>,
    batch_size: Option<usize>,
    max_concurrent: Option<usize>,
    max_retries: Option<u32>,
) -> (ApiConfig, ProcessingConfig) {
    let mut api = ApiConfig::default();
    if let Some(model) = model {
        api.model = model;
    }
    if let Some(max_retries) = max_retries {
        api.max_retries = max_retries;
    }
    let mut processing = ProcessingConfig::default();
    if let Some(batch_size) = batch_size {
        processing.batch_size = batch_size;
    }
    if let Some(max_concurrent) = max_concurrent {
        processing.max_concurrent = max_concurrent;
    }
    (api, processing)
}

fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, finishing in-flight work");
            flag.store(true, Ordering::Relaxed);
        }
    });
    cancel
}

async fn run_stage(
    reference: &PathBuf,
    out: &PathBuf,
    api: ApiConfig,
    processing: ProcessingConfig,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let cancel = cancel_on_ctrl_c();
    let report = run_validation(reference, out, api, processing, &cancel).await?;
    println!(
        "run {:?}: {} cases in {} batches ({:.1}s)",
        report.status, report.cases_processed, report.batches_written, report.elapsed_secs
    );
    Ok(report.status)
}

fn consolidate_stage(
    batches: &PathBuf,
    reference: &PathBuf,
    out: &PathBuf,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let stats = Consolidator::new(batches, reference, out).process()?;
    println!(
        "consolidated {} files -> {} unified records ({} overwritten, {} decode errors, {} parse errors, {} without id)",
        stats.files_read,
        stats.unified_records,
        stats.load.overwritten,
        stats.load.json_decode_errors,
        stats.load.parse_errors,
        stats.load.skipped_no_id
    );
    if !stats.report.missing.is_empty() || !stats.report.extra.is_empty() {
        println!(
            "reconcile: {} reference ids missing, {} extra ids",
            stats.report.missing.len(),
            stats.report.extra.len()
        );
    }
    println!(
        "expanded {} rows ({} parsing issues) -> {}",
        stats.expanded_rows,
        stats.parsing_issues,
        stats.expanded_path.display()
    );
    Ok(stats.unified_path)
}

fn triage_stage(unified: &PathBuf, out: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let summary = TriageAnalyzer::new(unified, out).run()?;
    println!("triaged {} records:", summary.total);
    for (class, count) in &summary.counts {
        println!("  {:<22} {}", class.as_str(), count);
    }
    if let Some(path) = &summary.fallback_truncated_path {
        println!("quarantined truncated -> {}", path.display());
    }
    if let Some(path) = &summary.inconsistent_path {
        println!("quarantined inconsistent -> {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            reference,
            out,
            model,
            batch_size,
            max_concurrent,
            max_retries,
        } => {
            let (api, processing) = build_configs(model, batch_size, max_concurrent, max_retries);
            let status = run_stage(&reference, &out, api, processing).await?;
            if status == RunStatus::Cancelled {
                std::process::exit(130);
            }
        }
        Commands::Consolidate {
            batches,
            reference,
            out,
        } => {
            consolidate_stage(&batches, &reference, &out)?;
        }
        Commands::Triage { unified, out } => {
            triage_stage(&unified, &out)?;
        }
        Commands::Pipeline {
            reference,
            out,
            model,
            batch_size,
            max_concurrent,
        } => {
            let (api, processing) = build_configs(model, batch_size, max_concurrent, None);
            let status = run_stage(&reference, &out, api, processing).await?;
            if status == RunStatus::Cancelled {
                std::process::exit(130);
            }
            if status == RunStatus::NoWork {
                return Err("reference file yielded no cases".into());
            }
            let unified = consolidate_stage(&out, &reference, &out)?;
            triage_stage(&unified, &out)?;
        }
    }

    Ok(())
}
