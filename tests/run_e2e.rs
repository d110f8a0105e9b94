use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use triage_harness::config::{ApiConfig, ProcessingConfig};
use triage_harness::consolidate::Consolidator;
use triage_harness::executor::RequestExecutor;
use triage_harness::gateway::DeepSeekAdapter;
use triage_harness::prompts::PromptSet;
use triage_harness::runner::{Runner, RunStatus};
use triage_harness::scheduler::Scheduler;
use triage_harness::triage::{FormatClass, TriageAnalyzer};

const TEXT_A: &str = "robo de celular en la via publica";
const TEXT_B: &str = "texto del caso problematico";

fn success_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    })
}

async fn mock_classifier() -> MockServer {
    let server = MockServer::start().await;

    // Case A: clean JSON with one classification item.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains(TEXT_A))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body(
            r#"{"razonamiento": "robo claro", "clasificaciones": [{"codigo": "9", "justificacion": "robo de celular"}]}"#,
        )))
        .mount(&server)
        .await;

    // Case B: the model answers with nothing at all.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains(TEXT_B))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("")))
        .mount(&server)
        .await;

    server
}

fn runner_for(server: &MockServer, out: &std::path::Path) -> Runner<DeepSeekAdapter> {
    let adapter =
        DeepSeekAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let api = ApiConfig {
        timeout: Duration::from_secs(5),
        max_retries: 1,
        ..ApiConfig::default()
    };
    let executor = Arc::new(RequestExecutor::new(adapter, api));
    let scheduler = Scheduler::new(executor, PromptSet::default(), 2);
    let processing = ProcessingConfig {
        batch_size: 10,
        max_concurrent: 2,
        memory_cleanup_every: 3,
    };
    Runner::new(scheduler, processing, out)
}

fn write_reference(path: &std::path::Path) {
    let lines = [
        json!({"id": "A", "text": TEXT_A, "expected": {"codes": ["9"], "origin_ids": []}}),
        json!({"id": "B", "text": TEXT_B, "expected": {"codes": ["21"], "origin_ids": []}}),
    ];
    let body: String = lines.iter().map(|v| format!("{v}\n")).collect();
    fs::write(path, body).unwrap();
}

#[tokio::test]
async fn full_pipeline_classifies_and_quarantines() {
    let server = mock_classifier().await;
    let dir = tempfile::tempdir().unwrap();
    let reference = dir.path().join("reference.jsonl");
    write_reference(&reference);
    let out = dir.path().join("results");

    // Stage 1: run.
    let cancel = AtomicBool::new(false);
    let report = runner_for(&server, &out)
        .run(&reference, &cancel)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.cases_total, 2);
    assert_eq!(report.cases_processed, 2);
    assert_eq!(report.batches_written, 1);

    // Exactly one record per submitted case, regardless of outcome.
    let batch_files: Vec<_> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_name().to_string_lossy().starts_with("results_batch_"))
        .collect();
    assert_eq!(batch_files.len(), 1);
    let batch_body = fs::read_to_string(batch_files[0].path()).unwrap();
    assert_eq!(batch_body.lines().count(), 2);

    // Stage 2: consolidate.
    let stats = Consolidator::new(&out, &reference, &out).process().unwrap();
    assert_eq!(stats.unified_records, 2);
    assert!(stats.report.missing.is_empty());
    assert!(stats.report.extra.is_empty());

    // Stage 3: triage.
    let summary = TriageAnalyzer::new(&stats.unified_path, &out).run().unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.count(FormatClass::Perfect), 1);
    assert_eq!(summary.count(FormatClass::Inconsistent), 1);
    assert!(summary.read_errors.is_empty());

    // Only the inconsistent quarantine exists, and it holds exactly B.
    assert!(summary.fallback_truncated_path.is_none());
    let quarantine = summary.inconsistent_path.unwrap();
    let body = fs::read_to_string(quarantine).unwrap();
    let records: Vec<serde_json::Value> = body
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "B");
}

#[tokio::test]
async fn rerun_backs_up_previous_results_instead_of_deleting() {
    let server = mock_classifier().await;
    let dir = tempfile::tempdir().unwrap();
    let reference = dir.path().join("reference.jsonl");
    write_reference(&reference);
    let out = dir.path().join("results");

    let cancel = AtomicBool::new(false);
    runner_for(&server, &out)
        .run(&reference, &cancel)
        .await
        .unwrap();
    runner_for(&server, &out)
        .run(&reference, &cancel)
        .await
        .unwrap();

    let entries: Vec<String> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let backups: Vec<_> = entries.iter().filter(|n| n.starts_with("backup_")).collect();
    let batches: Vec<_> = entries
        .iter()
        .filter(|n| n.starts_with("results_batch_"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(batches.len(), 1);

    // The first run's file survived the move.
    let backup_dir = out.join(backups[0]);
    assert_eq!(fs::read_dir(backup_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn pre_raised_cancel_flag_processes_nothing() {
    let server = mock_classifier().await;
    let dir = tempfile::tempdir().unwrap();
    let reference = dir.path().join("reference.jsonl");
    write_reference(&reference);
    let out = dir.path().join("results");

    let cancel = AtomicBool::new(true);
    let report = runner_for(&server, &out)
        .run(&reference, &cancel)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.batches_written, 0);

    let batch_files = fs::read_dir(&out)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("results_batch_")
        })
        .count();
    assert_eq!(batch_files, 0);
}

#[tokio::test]
async fn empty_reference_is_no_work() {
    let server = mock_classifier().await;
    let dir = tempfile::tempdir().unwrap();
    let reference = dir.path().join("reference.jsonl");
    fs::write(&reference, "").unwrap();

    let cancel = AtomicBool::new(false);
    let report = runner_for(&server, dir.path())
        .run(&reference, &cancel)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::NoWork);
    assert_eq!(report.cases_total, 0);
}
