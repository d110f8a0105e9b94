//! Domain types shared across the batch runner and the consolidation stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One free-text record submitted for classification.
///
/// Produced by the external ingestion collaborator and immutable once
/// handed to the runner. `id` is unique within a dataset run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub text: String,
    /// Expected classification codes, normalized (trimmed, deduplicated,
    /// sorted).
    pub expected_codes: Vec<String>,
    /// Identifiers of the original sub-records this case aggregates.
    /// Empty for ungrouped cases.
    pub origin_ids: Vec<String>,
}

/// Wire shape of one reference-file line.
///
/// `{"id": "...", "text": "...", "expected": {"codes": [...], "origin_ids": [...]}}`
#[derive(Debug, Deserialize)]
pub struct ReferenceLine {
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub expected: ExpectedPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExpectedPayload {
    #[serde(default)]
    pub codes: Vec<serde_json::Value>,
    #[serde(default)]
    pub origin_ids: Vec<String>,
}

impl ReferenceLine {
    /// Convert into a `Case`, normalizing the expected codes. Returns
    /// `None` when the line carries no identifier.
    pub fn into_case(self) -> Option<Case> {
        let id = self.id.filter(|id| !id.is_empty())?;
        Some(Case {
            id,
            text: self.text,
            expected_codes: normalize_codes(&self.expected.codes),
            origin_ids: self.expected.origin_ids,
        })
    }
}

/// Normalize a heterogeneous code list (strings, numbers) into trimmed,
/// deduplicated, sorted strings. Ingestion upstream is not fully trusted.
pub fn normalize_codes(raw: &[serde_json::Value]) -> Vec<String> {
    let mut codes = BTreeSet::new();
    for value in raw {
        match value {
            serde_json::Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    codes.insert(s.to_string());
                }
            }
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    codes.insert(i.to_string());
                } else if let Some(f) = n.as_f64() {
                    if f.is_finite() {
                        codes.insert((f as i64).to_string());
                    }
                }
            }
            _ => {}
        }
    }
    codes.into_iter().collect()
}

/// One persisted result line: the outcome of a case's full attempt
/// sequence, written exactly once per case per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    // Missing-id records must parse so the consolidator can count them
    // separately from structurally broken lines.
    #[serde(default, alias = "case_id")]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub expected_codes: Vec<String>,
    #[serde(default)]
    pub origin_ids: Vec<String>,
    #[serde(default)]
    pub predicted_codes: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub failed: bool,
}
