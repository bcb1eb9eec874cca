// src/validator/raw.rs
// Lenient extraction and strict schema parsing of model output

use crate::analysis::FixSuggestion;
use crate::error::{Result, TriageError};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("valid regex"));

#[allow(clippy::expect_used)]
static OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid regex"));

/// Pull a JSON object out of model text: bare, fenced, or embedded in prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parse = |s: &str| serde_json::from_str::<Value>(s).ok().filter(Value::is_object);

    if let Some(v) = parse(trimmed) {
        return Some(v);
    }
    if let Some(caps) = FENCED_RE.captures(trimmed)
        && let Some(v) = caps.get(1).and_then(|m| parse(m.as_str()))
    {
        return Some(v);
    }
    OBJECT_RE.find(trimmed).and_then(|m| parse(m.as_str()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRootCause {
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLocation {
    pub file: String,
    #[serde(default, alias = "line")]
    pub line_start: Option<u32>,
    #[serde(default)]
    pub line_end: Option<u32>,
    #[serde(default)]
    pub function: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawImpact {
    #[serde(default)]
    pub affected_users: Option<String>,
    #[serde(default)]
    pub affected_features: Vec<String>,
    #[serde(default)]
    pub urgency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSimilarCase {
    pub case_id: String,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub resolution: Option<String>,
}

/// The model's final answer before business rules are applied
#[derive(Debug, Clone, Deserialize)]
pub struct RawAnalysis {
    pub summary: String,
    pub root_cause: RawRootCause,
    #[serde(default)]
    pub location: Option<RawLocation>,
    pub fix_suggestion: FixSuggestion,
    #[serde(default)]
    pub impact_assessment: Option<RawImpact>,
    #[serde(default)]
    pub similar_cases: Vec<RawSimilarCase>,
    #[serde(default)]
    pub additional_investigation: Vec<String>,
}

/// Parse model text against the output schema.
///
/// Missing required fields, wrong types, an empty summary, or a confidence
/// outside [0,1] are all schema violations.
pub fn parse_analysis(text: &str) -> Result<RawAnalysis> {
    let value = extract_json(text)
        .ok_or_else(|| TriageError::SchemaViolation("reply contains no JSON object".into()))?;
    let raw: RawAnalysis =
        serde_json::from_value(value).map_err(|e| TriageError::SchemaViolation(e.to_string()))?;

    if raw.summary.trim().is_empty() {
        return Err(TriageError::SchemaViolation("summary is empty".into()));
    }
    if raw.root_cause.description.trim().is_empty() {
        return Err(TriageError::SchemaViolation("root_cause.description is empty".into()));
    }
    let confidence = raw.root_cause.confidence;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(TriageError::SchemaViolation(format!(
            "root_cause.confidence must be between 0 and 1, got {}",
            confidence
        )));
    }
    if let Some(loc) = &raw.location
        && loc.file.trim().is_empty()
    {
        return Err(TriageError::SchemaViolation("location.file is empty".into()));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FixType;

    const VALID: &str = r#"{
        "summary": "DB pool exhausted under load",
        "root_cause": {"description": "pool too small", "category": "PERFORMANCE.resource_contention", "confidence": 0.8},
        "location": {"file": "app/db.py", "line": 42},
        "fix_suggestion": {"type": "config_change", "description": "raise pool size"},
        "similar_cases": [{"case_id": "CASE-1"}]
    }"#;

    #[test]
    fn test_extract_bare_fenced_and_embedded() {
        assert!(extract_json(r#"{"a": 1}"#).is_some());
        assert!(extract_json("Here you go:\n```json\n{\"a\": 1}\n```\nThanks").is_some());
        assert!(extract_json("The answer is {\"a\": {\"b\": 2}} as requested").is_some());
        assert!(extract_json("[1, 2]").is_none());
        assert!(extract_json("no json").is_none());
        assert!(extract_json("").is_none());
    }

    #[test]
    fn test_parse_valid() {
        let raw = parse_analysis(VALID).unwrap();
        assert_eq!(raw.fix_suggestion.fix_type, FixType::ConfigChange);
        assert_eq!(raw.location.unwrap().line_start, Some(42));
        assert_eq!(raw.similar_cases[0].case_id, "CASE-1");
    }

    #[test]
    fn test_missing_required_field() {
        let err = parse_analysis(r#"{"summary": "x", "root_cause": {"description": "y", "confidence": 0.5}}"#)
            .unwrap_err();
        assert!(matches!(err, TriageError::SchemaViolation(ref m) if m.contains("fix_suggestion")));
    }

    #[test]
    fn test_wrong_type() {
        let text = r#"{"summary": "x", "root_cause": {"description": "y", "confidence": "high"},
            "fix_suggestion": {"type": "rollback", "description": "z"}}"#;
        assert!(parse_analysis(text).is_err());
    }

    #[test]
    fn test_confidence_out_of_range() {
        let text = r#"{"summary": "x", "root_cause": {"description": "y", "confidence": 1.7},
            "fix_suggestion": {"type": "rollback", "description": "z"}}"#;
        assert!(parse_analysis(text).is_err());
    }

    #[test]
    fn test_unknown_fix_type_is_violation() {
        let text = r#"{"summary": "x", "root_cause": {"description": "y", "confidence": 0.4},
            "fix_suggestion": {"type": "reboot", "description": "z"}}"#;
        assert!(parse_analysis(text).is_err());
    }
}
