//! Error Classifier: assigns every unified record a format class from the
//! shape of its raw response, and quarantines the two classes that need
//! manual review.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::case::CaseResult;

pub const ERRORS_DIR: &str = "errors";
pub const FALLBACK_TRUNCATED_FILENAME: &str = "fallback_truncated.jsonl";
pub const INCONSISTENT_FILENAME: &str = "inconsistent.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> TriageError {
    TriageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Format class of one unified record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FormatClass {
    /// Clean JSON with classification items, no fallback marker.
    Perfect,
    /// Fallback marker present but the payload is intact.
    FallbackRecoverable,
    /// Fallback marker present and the payload is broken JSON.
    FallbackTruncated,
    /// No fallback marker, yet the payload is broken or empty.
    Inconsistent,
    /// Fallback marker with valid JSON but no items.
    Other,
    /// The unified line itself could not be parsed.
    ReadError,
}

impl FormatClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatClass::Perfect => "perfect",
            FormatClass::FallbackRecoverable => "fallback_recoverable",
            FormatClass::FallbackTruncated => "fallback_truncated",
            FormatClass::Inconsistent => "inconsistent",
            FormatClass::Other => "other",
            FormatClass::ReadError => "read_error",
        }
    }
}

/// Classify one record from three observable booleans.
pub fn classify(record: &CaseResult) -> FormatClass {
    let is_fallback = record.reasoning.to_lowercase().contains("fallback");
    let parsed: Option<serde_json::Value> = serde_json::from_str(&record.raw_response).ok();
    let is_valid_json = parsed.is_some();
    let has_items = parsed
        .as_ref()
        .and_then(|v| v.get("clasificaciones"))
        .and_then(|v| v.as_array())
        .map(|items| !items.is_empty())
        .unwrap_or(false);

    match (is_fallback, is_valid_json, has_items) {
        (false, true, true) => FormatClass::Perfect,
        (true, true, true) => FormatClass::FallbackRecoverable,
        (true, false, _) => FormatClass::FallbackTruncated,
        (false, _, _) => FormatClass::Inconsistent,
        _ => FormatClass::Other,
    }
}

/// A unified line that failed outer JSON parsing.
#[derive(Debug, Clone, Serialize)]
pub struct ReadErrorRecord {
    pub line: usize,
    pub error: String,
    pub partial: String,
}

#[derive(Debug)]
pub struct TriageSummary {
    pub total: usize,
    pub counts: BTreeMap<FormatClass, usize>,
    pub read_errors: Vec<ReadErrorRecord>,
    pub fallback_truncated_path: Option<PathBuf>,
    pub inconsistent_path: Option<PathBuf>,
}

impl TriageSummary {
    pub fn count(&self, class: FormatClass) -> usize {
        self.counts.get(&class).copied().unwrap_or(0)
    }
}

/// Reads the unified file, classifies every record, and writes the two
/// quarantine files (only when they would be non-empty).
pub struct TriageAnalyzer {
    unified_path: PathBuf,
    output_dir: PathBuf,
}

impl TriageAnalyzer {
    pub fn new(unified_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            unified_path: unified_path.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn run(&self) -> Result<TriageSummary, TriageError> {
        let file = File::open(&self.unified_path).map_err(|e| io_err(&self.unified_path, e))?;

        let mut counts: BTreeMap<FormatClass, usize> = BTreeMap::new();
        let mut read_errors = Vec::new();
        let mut truncated = Vec::new();
        let mut inconsistent = Vec::new();
        let mut total = 0usize;

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_err(&self.unified_path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            total += 1;
            let record: CaseResult = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(err) => {
                    *counts.entry(FormatClass::ReadError).or_insert(0) += 1;
                    read_errors.push(ReadErrorRecord {
                        line: number + 1,
                        error: err.to_string(),
                        partial: line.chars().take(200).collect(),
                    });
                    warn!(line = number + 1, error = %err, "unreadable unified line");
                    continue;
                }
            };

            let class = classify(&record);
            *counts.entry(class).or_insert(0) += 1;
            match class {
                FormatClass::FallbackTruncated => truncated.push(record),
                FormatClass::Inconsistent => inconsistent.push(record),
                _ => {}
            }
        }

        let errors_dir = self.output_dir.join(ERRORS_DIR);
        let fallback_truncated_path =
            self.quarantine(&errors_dir, FALLBACK_TRUNCATED_FILENAME, &truncated)?;
        let inconsistent_path =
            self.quarantine(&errors_dir, INCONSISTENT_FILENAME, &inconsistent)?;

        for (class, count) in &counts {
            info!(class = class.as_str(), count, "triage class");
        }
        info!(total, read_errors = read_errors.len(), "triage complete");

        Ok(TriageSummary {
            total,
            counts,
            read_errors,
            fallback_truncated_path,
            inconsistent_path,
        })
    }

    fn quarantine(
        &self,
        errors_dir: &Path,
        filename: &str,
        records: &[CaseResult],
    ) -> Result<Option<PathBuf>, TriageError> {
        if records.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(errors_dir).map_err(|e| io_err(errors_dir, e))?;
        let path = errors_dir.join(filename);
        let file = File::create(&path).map_err(|e| io_err(&path, e))?;
        let mut writer = BufWriter::new(file);
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| io_err(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            writer.write_all(line.as_bytes()).map_err(|e| io_err(&path, e))?;
            writer.write_all(b"\n").map_err(|e| io_err(&path, e))?;
        }
        writer.flush().map_err(|e| io_err(&path, e))?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reasoning: &str, raw: &str) -> CaseResult {
        CaseResult {
            id: "a".to_string(),
            text: String::new(),
            expected_codes: Vec::new(),
            origin_ids: Vec::new(),
            predicted_codes: Vec::new(),
            reasoning: reasoning.to_string(),
            raw_response: raw.to_string(),
            timestamp: String::new(),
            failed: false,
        }
    }

    const VALID_WITH_ITEMS: &str =
        r#"{"razonamiento": "ok", "clasificaciones": [{"codigo": "9", "justificacion": "x"}]}"#;
    const VALID_NO_ITEMS: &str = r#"{"razonamiento": "nada", "clasificaciones": []}"#;

    #[test]
    fn clean_record_is_perfect() {
        assert_eq!(
            classify(&record("clasificado", VALID_WITH_ITEMS)),
            FormatClass::Perfect
        );
    }

    #[test]
    fn fallback_with_intact_payload_is_recoverable() {
        assert_eq!(
            classify(&record("FALLBACK: rescued from prose", VALID_WITH_ITEMS)),
            FormatClass::FallbackRecoverable
        );
    }

    #[test]
    fn fallback_with_broken_json_is_truncated_regardless_of_items() {
        assert_eq!(
            classify(&record("fallback parse", r#"{"razonamiento": "rob"#)),
            FormatClass::FallbackTruncated
        );
    }

    #[test]
    fn broken_or_empty_payload_without_fallback_is_inconsistent() {
        assert_eq!(classify(&record("ok", "")), FormatClass::Inconsistent);
        assert_eq!(
            classify(&record("ok", VALID_NO_ITEMS)),
            FormatClass::Inconsistent
        );
    }

    #[test]
    fn fallback_with_valid_empty_payload_is_other() {
        assert_eq!(
            classify(&record("fallback", VALID_NO_ITEMS)),
            FormatClass::Other
        );
    }
}
