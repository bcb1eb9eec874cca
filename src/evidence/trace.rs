// src/evidence/trace.rs
// On-demand trace lookup as an evidence source

use super::backend::{BackendError, TraceBackend};
use super::{EvidenceItem, EvidencePayload, EvidenceQuery, EvidenceSource, SourceError, SourceKind, SourceLimits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Tag prefix marking a trace as linked to a historical case
const CASE_TAG_PREFIX: &str = "case:";

/// Trace fields copied into the snapshot detail
const SNAPSHOT_FIELDS: &[&str] = &["timestamp", "input", "output", "metadata", "release", "version"];

/// Looks up the report's trace in the tracing backend. Yields one
/// `TraceSnapshot`, plus a `CaseMatch` for every `case:<id>` tag on the trace.
pub struct TraceEvidenceSource {
    backend: Arc<dyn TraceBackend>,
    limits: SourceLimits,
}

impl TraceEvidenceSource {
    pub fn new(backend: Arc<dyn TraceBackend>, limits: SourceLimits) -> Self {
        Self { backend, limits }
    }
}

/// Reduce a raw trace to the parts useful as evidence
pub(crate) fn snapshot(trace_id: &str, trace: &Value) -> (EvidenceItem, Vec<String>) {
    let tags: Vec<String> = trace
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let mut detail = Map::new();
    for field in SNAPSHOT_FIELDS {
        if let Some(v) = trace.get(*field).filter(|v| !v.is_null()) {
            detail.insert((*field).to_string(), v.clone());
        }
    }
    let errors: Vec<Value> = trace
        .get("observations")
        .and_then(Value::as_array)
        .map(|obs| {
            obs.iter()
                .filter(|o| o.get("level").and_then(Value::as_str) == Some("ERROR"))
                .map(|o| {
                    json!({
                        "name": o.get("name"),
                        "type": o.get("type"),
                        "status_message": o.get("statusMessage"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if !errors.is_empty() {
        detail.insert("error_observations".into(), Value::Array(errors));
    }

    let recency = trace
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let mut item = EvidenceItem::new(
        trace_id,
        SourceKind::Trace,
        1.0,
        EvidencePayload::TraceSnapshot {
            trace_id: trace_id.to_string(),
            name: trace.get("name").and_then(Value::as_str).map(str::to_string),
            session_id: trace
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string),
            tags: tags.clone(),
            detail: Value::Object(detail),
        },
    );
    item.recency = recency;
    (item, tags)
}

#[async_trait]
impl EvidenceSource for TraceEvidenceSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Trace
    }

    fn limits(&self) -> SourceLimits {
        self.limits
    }

    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceItem>, SourceError> {
        let Some(trace_id) = query.trace_id.as_deref() else {
            return Ok(Vec::new());
        };

        let trace = match self.backend.get_trace(trace_id).await {
            Ok(trace) => trace,
            Err(BackendError::NotFound(_)) => return Ok(Vec::new()),
            Err(BackendError::Decode(e)) => return Err(SourceError::Decode(e)),
            Err(BackendError::Rejected { status, body }) => {
                return Err(SourceError::Rejected { status, body });
            }
            Err(e) => return Err(SourceError::Transport(e.to_string())),
        };

        let (item, tags) = snapshot(trace_id, &trace);
        let recency = item.recency;
        let mut items = vec![item];
        for case_id in tags.iter().filter_map(|t| t.strip_prefix(CASE_TAG_PREFIX)) {
            let case_id = case_id.trim();
            if case_id.is_empty() {
                continue;
            }
            let mut cross_ref = EvidenceItem::new(
                format!("{}#{}", trace_id, case_id),
                SourceKind::Trace,
                1.0,
                EvidencePayload::CaseMatch {
                    case_id: case_id.to_string(),
                    title: format!("linked from trace {}", trace_id),
                    root_cause: None,
                    resolution: None,
                    category: None,
                },
            );
            cross_ref.recency = recency;
            items.push(cross_ref);
        }
        items.truncate(self.limits.max_items.max(1));
        Ok(items)
    }
}
