// src/evidence/mod.rs
// Evidence sources consumed by the fusion engine

pub mod backend;
pub mod http;
pub mod trace;

use crate::classifier::Category;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

pub use backend::{BackendError, LangfuseClient, ObservationType, TraceBackend, TraceSearch};
pub use http::HttpEvidenceSource;
pub use trace::TraceEvidenceSource;

/// Which knowledge source produced an item.
///
/// Declaration order is the tie-break priority used by fusion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    Case,
    Code,
    Pattern,
    Trace,
    Config,
}

impl SourceKind {
    /// Lower value wins ties
    pub fn priority(self) -> u8 {
        self as u8
    }
}

/// Typed content of an evidence item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidencePayload {
    CaseMatch {
        case_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        root_cause: Option<String>,
        #[serde(default)]
        resolution: Option<String>,
        #[serde(default)]
        category: Option<String>,
    },
    CodeMatch {
        file: String,
        #[serde(default)]
        line_start: Option<u32>,
        #[serde(default)]
        line_end: Option<u32>,
        #[serde(default)]
        function: Option<String>,
        #[serde(default)]
        snippet: String,
    },
    PatternMatch {
        pattern_id: String,
        #[serde(default)]
        pattern: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        suggested_category: Option<String>,
    },
    TraceSnapshot {
        trace_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        detail: serde_json::Value,
    },
}

impl EvidencePayload {
    /// Logical identity used for deduplication across sources.
    ///
    /// Two items describing the same case, file location, pattern or trace
    /// share a key regardless of which source returned them.
    pub fn entity_key(&self) -> String {
        match self {
            Self::CaseMatch { case_id, .. } => format!("case:{}", case_id),
            Self::CodeMatch {
                file, line_start, ..
            } => match line_start {
                Some(line) => format!("code:{}:{}", file, line),
                None => format!("code:{}", file),
            },
            Self::PatternMatch { pattern_id, .. } => format!("pattern:{}", pattern_id),
            Self::TraceSnapshot { trace_id, .. } => format!("trace:{}", trace_id),
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::CaseMatch { .. } => "case_match",
            Self::CodeMatch { .. } => "code_match",
            Self::PatternMatch { .. } => "pattern_match",
            Self::TraceSnapshot { .. } => "trace_snapshot",
        }
    }
}

/// One result returned by an evidence source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Source-local stable identifier
    pub id: String,
    pub source: SourceKind,
    /// Relevance in [0,1] on the source's own scale
    pub raw_score: f64,
    #[serde(default)]
    pub recency: Option<DateTime<Utc>>,
    pub payload: EvidencePayload,
}

impl EvidenceItem {
    pub fn new(id: impl Into<String>, source: SourceKind, raw_score: f64, payload: EvidencePayload) -> Self {
        Self {
            id: id.into(),
            source,
            raw_score: raw_score.clamp(0.0, 1.0),
            recency: None,
            payload,
        }
    }

    pub fn with_recency(mut self, at: DateTime<Utc>) -> Self {
        self.recency = Some(at);
        self
    }
}

/// The report context every source is queried with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceQuery {
    pub bug_id: String,
    pub text: String,
    pub category: Category,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    pub service: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Business-code files named in the stack trace
    #[serde(default)]
    pub files: Vec<String>,
    pub limit: usize,
}

/// Per-call budget declared by a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLimits {
    pub timeout: Duration,
    pub max_items: usize,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),
}

/// How a single source query ended. Timeouts, errors and empty answers are
/// kept apart so the retrieval summary can say which one happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Items { count: usize },
    Empty,
    TimedOut { after_ms: u64 },
    Failed { reason: String },
    Skipped { reason: String },
}

impl SourceOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Items { .. })
    }
}

/// A read-only knowledge source
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn limits(&self) -> SourceLimits;

    /// Return at most `limits().max_items` items, best first.
    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceItem>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_follows_declaration_order() {
        assert!(SourceKind::Case.priority() < SourceKind::Code.priority());
        assert!(SourceKind::Code.priority() < SourceKind::Pattern.priority());
        assert!(SourceKind::Pattern.priority() < SourceKind::Trace.priority());
        assert!(SourceKind::Trace.priority() < SourceKind::Config.priority());
    }

    #[test]
    fn test_entity_key_ignores_source() {
        let from_store = EvidencePayload::CaseMatch {
            case_id: "CASE-7".into(),
            title: "pool exhausted".into(),
            root_cause: None,
            resolution: None,
            category: None,
        };
        let from_trace = EvidencePayload::CaseMatch {
            case_id: "CASE-7".into(),
            title: String::new(),
            root_cause: None,
            resolution: None,
            category: None,
        };
        assert_eq!(from_store.entity_key(), from_trace.entity_key());
    }

    #[test]
    fn test_code_entity_key_includes_line() {
        let payload = EvidencePayload::CodeMatch {
            file: "app/db.py".into(),
            line_start: Some(42),
            line_end: None,
            function: None,
            snippet: String::new(),
        };
        assert_eq!(payload.entity_key(), "code:app/db.py:42");
    }

    #[test]
    fn test_payload_tagged_json() {
        let json = r#"{"type": "pattern_match", "pattern_id": "P-1", "pattern": "timeout"}"#;
        let payload: EvidencePayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.variant_name(), "pattern_match");
        assert_eq!(payload.entity_key(), "pattern:P-1");
    }

    #[test]
    fn test_item_clamps_raw_score() {
        let item = EvidenceItem::new(
            "x",
            SourceKind::Code,
            7.5,
            EvidencePayload::PatternMatch {
                pattern_id: "x".into(),
                pattern: String::new(),
                description: String::new(),
                suggested_category: None,
            },
        );
        assert_eq!(item.raw_score, 1.0);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(SourceOutcome::TimedOut { after_ms: 500 }).unwrap();
        assert_eq!(json["status"], "timed_out");
        assert_eq!(json["after_ms"], 500);
        assert!(SourceOutcome::Items { count: 1 }.succeeded());
        assert!(!SourceOutcome::Empty.succeeded());
    }
}
