//! Consolidator: collapses all batch files of a dataset into one unified
//! view keyed by case id, cross-checks against the reference case list,
//! and emits the flattened per-sub-record expansion.
//!
//! Every per-line failure is counted and skipped. Only resource-level
//! problems (missing directory, unreadable file) are errors.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::case::{Case, CaseResult, ReferenceLine};
use crate::parser;

/// Batch filename patterns tried in order; the first with any match wins.
const FILE_PATTERNS: [(&str, &str); 3] = [
    ("results_batch_", ".jsonl"),
    ("results_", ".jsonl"),
    ("batch_", ".jsonl"),
];

pub const UNIFIED_FILENAME: &str = "unified_results.jsonl";
pub const EXPANDED_FILENAME: &str = "expanded_results.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum ConsolidateError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no batch files found in {0}")]
    NoBatchFiles(PathBuf),
}

fn io_err(path: &Path, source: std::io::Error) -> ConsolidateError {
    ConsolidateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Per-load tolerances: everything here is informational.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub json_decode_errors: usize,
    pub parse_errors: usize,
    pub skipped_no_id: usize,
    pub overwritten: usize,
}

/// Set difference between unified results and the reference case list.
#[derive(Debug, Default, Clone)]
pub struct ConsistencyReport {
    /// Reference ids with no unified record.
    pub missing: Vec<String>,
    /// Unified ids absent from the reference.
    pub extra: Vec<String>,
}

/// One flattened output row: a grouped case emits one row per original
/// sub-record id, each carrying the full prediction payload.
#[derive(Debug, Clone, Serialize)]
pub struct FlatRow {
    pub origin_id: Option<String>,
    pub case_id: String,
    pub text: String,
    pub expected_codes: Vec<String>,
    pub predicted_codes: Vec<String>,
    pub reasoning: String,
    pub detailed_predictions: BTreeMap<String, String>,
    pub timestamp: String,
    pub failed: bool,
}

/// A unified record whose flat code list disagrees with the detailed
/// code→justification map extracted from the same raw response.
#[derive(Debug, Clone, Serialize)]
pub struct ParsingIssue {
    pub case_id: String,
    pub predicted_codes: Vec<String>,
    pub detailed_codes: Vec<String>,
}

const MAX_RETAINED_ISSUES: usize = 10;

/// Everything `process()` learned, for the reporting layer.
#[derive(Debug)]
pub struct ConsolidationStats {
    pub files_read: usize,
    pub unified_records: usize,
    pub reference_cases: usize,
    pub load: LoadStats,
    pub report: ConsistencyReport,
    pub expanded_rows: usize,
    pub parsing_issues: usize,
    pub parsing_issue_examples: Vec<ParsingIssue>,
    pub unified_path: PathBuf,
    pub expanded_path: PathBuf,
}

pub struct Consolidator {
    batch_dir: PathBuf,
    reference_path: PathBuf,
    output_dir: PathBuf,
}

impl Consolidator {
    pub fn new(
        batch_dir: impl Into<PathBuf>,
        reference_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            batch_dir: batch_dir.into(),
            reference_path: reference_path.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Full consolidation: discover, unify, reconcile, write, expand.
    pub fn process(&self) -> Result<ConsolidationStats, ConsolidateError> {
        let files = find_batch_files(&self.batch_dir)?;
        if files.is_empty() {
            return Err(ConsolidateError::NoBatchFiles(self.batch_dir.clone()));
        }
        info!(files = files.len(), dir = %self.batch_dir.display(), "consolidating batch files");

        let (unified, load) = load_batches(&files)?;
        let reference = load_reference(&self.reference_path)?;
        let report = reconcile(&unified, &reference);
        if !report.missing.is_empty() || !report.extra.is_empty() {
            warn!(
                missing = report.missing.len(),
                extra = report.extra.len(),
                "unified results do not line up with the reference"
            );
        }

        fs::create_dir_all(&self.output_dir).map_err(|e| io_err(&self.output_dir, e))?;
        let unified_path = self.output_dir.join(UNIFIED_FILENAME);
        write_jsonl(&unified_path, unified.values())?;

        let (rows, issues) = expand(&unified, &reference);
        let expanded_path = self.output_dir.join(EXPANDED_FILENAME);
        write_jsonl(&expanded_path, rows.iter())?;

        let parsing_issues = issues.len();
        let mut parsing_issue_examples = issues;
        parsing_issue_examples.truncate(MAX_RETAINED_ISSUES);

        info!(
            unified = unified.len(),
            expanded = rows.len(),
            overwritten = load.overwritten,
            parsing_issues,
            "consolidation complete"
        );

        Ok(ConsolidationStats {
            files_read: files.len(),
            unified_records: unified.len(),
            reference_cases: reference.len(),
            load,
            report,
            expanded_rows: rows.len(),
            parsing_issues,
            parsing_issue_examples,
            unified_path,
            expanded_path,
        })
    }
}

/// Discover batch files. Patterns are tried in order of specificity and
/// the first one with any match wins; matches come back sorted by filename
/// so "last file wins" is reproducible.
pub fn find_batch_files(dir: &Path) -> Result<Vec<PathBuf>, ConsolidateError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if entry.path().is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    for (prefix, suffix) in FILE_PATTERNS {
        let mut matches: Vec<&String> = names
            .iter()
            .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
            .collect();
        if !matches.is_empty() {
            matches.sort();
            return Ok(matches.into_iter().map(|n| dir.join(n)).collect());
        }
    }
    Ok(Vec::new())
}

/// Collapse batch files into one record per case id. Files are consumed in
/// the given (sorted) order, so a repeated id keeps the last-seen record.
pub fn load_batches(
    files: &[PathBuf],
) -> Result<(BTreeMap<String, CaseResult>, LoadStats), ConsolidateError> {
    let mut unified = BTreeMap::new();
    let mut stats = LoadStats::default();

    for path in files {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_err(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(err) => {
                    stats.json_decode_errors += 1;
                    warn!(file = %path.display(), line = number + 1, error = %err, "undecodable line");
                    continue;
                }
            };
            let record: CaseResult = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(err) => {
                    stats.parse_errors += 1;
                    warn!(file = %path.display(), line = number + 1, error = %err, "line is not a result record");
                    continue;
                }
            };
            if record.id.trim().is_empty() {
                stats.skipped_no_id += 1;
                continue;
            }
            if unified.insert(record.id.clone(), record).is_some() {
                stats.overwritten += 1;
            }
        }
    }
    Ok((unified, stats))
}

/// Read the authoritative case list with the same per-line tolerance.
pub fn load_reference(path: &Path) -> Result<BTreeMap<String, Case>, ConsolidateError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reference = BTreeMap::new();
    let mut skipped = 0usize;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReferenceLine>(&line) {
            Ok(parsed) => match parsed.into_case() {
                Some(case) => {
                    reference.insert(case.id.clone(), case);
                }
                None => {
                    skipped += 1;
                    warn!(file = %path.display(), line = number + 1, "reference line has no id, skipping");
                }
            },
            Err(err) => {
                skipped += 1;
                warn!(file = %path.display(), line = number + 1, error = %err, "malformed reference line");
            }
        }
    }
    if skipped > 0 {
        warn!(file = %path.display(), skipped, loaded = reference.len(), "reference file had unusable lines");
    }
    Ok(reference)
}

/// Pure set comparison between unified ids and reference ids.
pub fn reconcile(
    unified: &BTreeMap<String, CaseResult>,
    reference: &BTreeMap<String, Case>,
) -> ConsistencyReport {
    let missing = reference
        .keys()
        .filter(|id| !unified.contains_key(*id))
        .cloned()
        .collect();
    let extra = unified
        .keys()
        .filter(|id| !reference.contains_key(*id))
        .cloned()
        .collect();
    ConsistencyReport { missing, extra }
}

/// Flatten grouped cases: one row per origin id, in reference order. A
/// record absent from the reference falls back to its own origin ids, so
/// no unified record is ever dropped from the flattened view.
pub fn expand(
    unified: &BTreeMap<String, CaseResult>,
    reference: &BTreeMap<String, Case>,
) -> (Vec<FlatRow>, Vec<ParsingIssue>) {
    let mut rows = Vec::new();
    let mut issues = Vec::new();

    for record in unified.values() {
        let detailed = parser::parse_detailed(&record.raw_response);

        let detailed_codes: Vec<String> = detailed.keys().cloned().collect();
        if !record.failed && detailed_codes != record.predicted_codes {
            issues.push(ParsingIssue {
                case_id: record.id.clone(),
                predicted_codes: record.predicted_codes.clone(),
                detailed_codes,
            });
        }

        let origin_ids = reference
            .get(&record.id)
            .map(|case| case.origin_ids.as_slice())
            .unwrap_or(record.origin_ids.as_slice());

        let make_row = |origin_id: Option<String>| FlatRow {
            origin_id,
            case_id: record.id.clone(),
            text: record.text.clone(),
            expected_codes: record.expected_codes.clone(),
            predicted_codes: record.predicted_codes.clone(),
            reasoning: record.reasoning.clone(),
            detailed_predictions: detailed.clone(),
            timestamp: record.timestamp.clone(),
            failed: record.failed,
        };

        if origin_ids.is_empty() {
            rows.push(make_row(None));
        } else {
            for origin_id in origin_ids {
                rows.push(make_row(Some(origin_id.clone())));
            }
        }
    }
    (rows, issues)
}

fn write_jsonl<'a, T, I>(path: &Path, items: I) -> Result<(), ConsolidateError>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut writer = BufWriter::new(file);
    for item in items {
        // FlatRow/CaseResult serialization cannot fail structurally; map
        // any serializer error through io for a single error surface.
        let line = serde_json::to_string(item)
            .map_err(|e| io_err(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        writer.write_all(line.as_bytes()).map_err(|e| io_err(path, e))?;
        writer.write_all(b"\n").map_err(|e| io_err(path, e))?;
    }
    writer.flush().map_err(|e| io_err(path, e))?;
    Ok(())
}
