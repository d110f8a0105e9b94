//! Tiered extraction of classification data from raw model output.
//!
//! The remote classifier is supposed to answer with one JSON object:
//! `{"razonamiento": "...", "clasificaciones": [{"codigo": "9",
//! "justificacion": "..."}]}` — but real responses are routinely wrapped in
//! prose, malformed, or cut off mid-string by the token cap. Each tier is
//! only attempted when the previous one fails, so well-formed output never
//! pays the regex cost.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Appended to tier-3 justifications so downstream consumers can tell
/// truncated-but-present data from missing data.
pub const TRUNCATION_MARKER: &str = " [TRUNCATED]";

/// Complete `{"codigo": "...", "justificacion": "..."}` block, possibly
/// embedded in surrounding prose.
static COMPLETE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\{\s*"codigo":\s*"(?P<code>\d+)"\s*,\s*"justificacion":\s*"(?P<just>.*?)"\s*\}"#)
        .expect("invalid complete-block regex")
});

/// Trailing object with the closing quote/brace missing.
static TRUNCATED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\{\s*"codigo":\s*"(?P<code>\d+)"\s*,\s*"justificacion":\s*"(?P<just>.*)"#)
        .expect("invalid truncated-block regex")
});

/// Full object carrying a `clasificaciones` array, used to rescue valid
/// JSON fragments surrounded by prose.
static CLASSIFICATIONS_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\{.*?"clasificaciones":\s*\[.*?\]\s*\}"#)
        .expect("invalid classifications-object regex")
});

/// Bare `"codigo": "N"` occurrence, last-resort code scan.
static CODE_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""codigo":\s*"(\d+)""#).expect("invalid code-only regex"));

/// Extract the predicted code list and the model's reasoning from a raw
/// response. Never fails; an unusable response yields an empty code list
/// and an explanatory reasoning string.
pub fn extract_codes(raw: &str) -> (Vec<String>, String) {
    let trimmed = raw.trim();

    // Tier 1: the whole response is one JSON object.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            let reasoning = value
                .get("razonamiento")
                .and_then(|v| v.as_str())
                .unwrap_or("no reasoning provided")
                .to_string();
            return (codes_from_value(&value), reasoning);
        }
    }

    // Tier 2: a valid classifications object embedded in prose. The
    // "fallback" prefix is the marker the triage stage keys off.
    if let Some(m) = CLASSIFICATIONS_OBJECT.find(raw) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(m.as_str()) {
            let reasoning = value
                .get("razonamiento")
                .and_then(|v| v.as_str())
                .unwrap_or("JSON rescued from surrounding text");
            return (
                codes_from_value(&value),
                format!("fallback: {reasoning}"),
            );
        }
    }

    // Tier 3: bare code scan.
    let codes: BTreeSet<String> = CODE_ONLY
        .captures_iter(raw)
        .map(|c| c[1].to_string())
        .collect();
    if !codes.is_empty() {
        return (
            codes.into_iter().collect(),
            "fallback: codes recovered by regex scan".to_string(),
        );
    }

    let prefix: String = raw.chars().take(100).collect();
    (
        Vec::new(),
        format!("parse error - invalid response: {prefix}..."),
    )
}

fn codes_from_value(value: &serde_json::Value) -> Vec<String> {
    let mut codes = BTreeSet::new();
    if let Some(items) = value.get("clasificaciones").and_then(|v| v.as_array()) {
        for item in items {
            if let Some(code) = item.get("codigo") {
                match code {
                    serde_json::Value::String(s) if !s.is_empty() => {
                        codes.insert(s.clone());
                    }
                    serde_json::Value::Number(n) => {
                        codes.insert(n.to_string());
                    }
                    _ => {}
                }
            }
        }
    }
    codes.into_iter().collect()
}

/// Extract the code → justification mapping from a raw response.
///
/// Tier 1 parses the whole response as JSON; tier 2 scans for complete
/// blocks anywhere in the text; tier 3 rescues a single truncated trailing
/// object, tagging its justification with [`TRUNCATION_MARKER`].
///
/// An empty map means "no classification extracted", not "classified with
/// zero items" — callers cross-checking against the predicted-codes list
/// must treat it that way.
pub fn parse_detailed(raw: &str) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();

    if raw.is_empty() {
        return details;
    }

    // Tier 1: strict parse. Only an object that actually carries the
    // classifications key short-circuits; valid JSON of another shape
    // falls through to the regex tiers.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(items) = value.get("clasificaciones").and_then(|v| v.as_array()) {
            for item in items {
                let code = item.get("codigo").and_then(code_as_string);
                let just = item.get("justificacion").and_then(|v| v.as_str());
                if let (Some(code), Some(just)) = (code, just) {
                    details.insert(code, just.to_string());
                }
            }
            return details;
        }
    }

    // Tier 2: complete blocks embedded anywhere.
    for caps in COMPLETE_BLOCK.captures_iter(raw) {
        details.insert(caps["code"].to_string(), caps["just"].to_string());
    }

    // Tier 3: a truncated trailing object after the last opening brace.
    if let Some(pos) = raw.rfind('{') {
        if let Some(caps) = TRUNCATED_BLOCK.captures(&raw[pos..]) {
            let code = caps["code"].to_string();
            if !details.contains_key(&code) {
                let justification = format!("{}{}", &caps["just"], TRUNCATION_MARKER);
                details.insert(code, justification);
            }
        }
    }

    details
}

fn code_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_extracts_codes_and_reasoning() {
        let raw = r#"{"razonamiento": "robo consumado", "clasificaciones": [
            {"codigo": "9", "justificacion": "robo de celular"},
            {"codigo": "2", "justificacion": "intento de robo de vehiculo"}
        ]}"#;

        let (codes, reasoning) = extract_codes(raw);
        assert_eq!(codes, vec!["2", "9"]);
        assert_eq!(reasoning, "robo consumado");

        let details = parse_detailed(raw);
        assert_eq!(details.len(), 2);
        assert_eq!(details["9"], "robo de celular");
    }

    #[test]
    fn json_embedded_in_prose_is_rescued() {
        let raw = r#"Claro, aqui va mi analisis:
{"razonamiento": "hurto", "clasificaciones": [{"codigo": "9", "justificacion": "hurto simple"}]}
Espero que sirva."#;

        let (codes, reasoning) = extract_codes(raw);
        assert_eq!(codes, vec!["9"]);
        assert_eq!(reasoning, "fallback: hurto");

        let details = parse_detailed(raw);
        assert_eq!(details["9"], "hurto simple");
    }

    #[test]
    fn truncated_trailing_object_gets_marker() {
        let raw = r#"{"codigo": "9", "justificacion": "robo de celu"#;
        let details = parse_detailed(raw);
        assert_eq!(details.len(), 1);
        let just = &details["9"];
        assert!(just.starts_with("robo de celu"));
        assert!(just.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn complete_blocks_take_precedence_over_truncated_tail() {
        let raw = concat!(
            r#"{"codigo": "9", "justificacion": "completa"}"#,
            "\n",
            r#"{"codigo": "2", "justificacion": "cortada aqu"#
        );
        let details = parse_detailed(raw);
        assert_eq!(details["9"], "completa");
        assert!(details["2"].ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn empty_and_garbage_responses_yield_empty_maps() {
        assert!(parse_detailed("").is_empty());
        assert!(parse_detailed("no json here").is_empty());

        let (codes, reasoning) = extract_codes("");
        assert!(codes.is_empty());
        assert!(reasoning.starts_with("parse error"));
    }

    #[test]
    fn bare_code_scan_recovers_codes_without_structure() {
        let raw = r#"los codigos son "codigo": "9" y tambien "codigo": "21" fin"#;
        let (codes, reasoning) = extract_codes(raw);
        assert_eq!(codes, vec!["21", "9"]);
        assert_eq!(reasoning, "fallback: codes recovered by regex scan");
    }

    #[test]
    fn numeric_codes_are_stringified() {
        let raw = r#"{"razonamiento": "x", "clasificaciones": [{"codigo": 9, "justificacion": "y"}]}"#;
        let (codes, _) = extract_codes(raw);
        assert_eq!(codes, vec!["9"]);
        assert_eq!(parse_detailed(raw)["9"], "y");
    }
}
