// src/tools/mod.rs
// Tool catalog offered to the reasoning model, with argument validation

pub mod executor;

pub use executor::ToolExecutor;

use crate::evidence::{ObservationType, TraceSearch};
use crate::llm::{Tool, ToolCall};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::LazyLock;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

/// Default and ceiling for `search_traces.limit`
const DEFAULT_SEARCH_LIMIT: u32 = 10;
const MAX_SEARCH_LIMIT: u32 = 50;

/// Names the model may call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ToolName {
    GetTrace,
    SearchTraces,
    GetSessionTraces,
    GetSpans,
    GetGenerations,
    GetObservations,
}

impl ToolName {
    pub fn description(self) -> &'static str {
        match self {
            Self::GetTrace => "Fetch one trace by id, including input, output, metadata and tags.",
            Self::SearchTraces => "Search traces by name within an optional time range.",
            Self::GetSessionTraces => "Fetch a session and the traces recorded in it.",
            Self::GetSpans => "List the timed spans of a trace.",
            Self::GetGenerations => "List model generations (prompt, response, usage) of a trace.",
            Self::GetObservations => "List observations of a trace, optionally filtered by type.",
        }
    }

    fn parameters(self) -> Value {
        match self {
            Self::GetTrace | Self::GetSpans | Self::GetGenerations => schema_of::<TraceIdArgs>(),
            Self::SearchTraces => schema_of::<SearchTracesArgs>(),
            Self::GetSessionTraces => schema_of::<SessionArgs>(),
            Self::GetObservations => schema_of::<ObservationsArgs>(),
        }
    }
}

// ============================================================================
// Argument schemas
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TraceIdArgs {
    #[schemars(description = "Trace identifier")]
    pub trace_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    #[schemars(description = "RFC 3339 start timestamp")]
    pub from: Option<String>,
    #[schemars(description = "RFC 3339 end timestamp")]
    pub to: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchTracesArgs {
    #[schemars(description = "Text matched against trace names")]
    pub query: String,
    #[schemars(description = "Optional time window")]
    pub time_range: Option<TimeRange>,
    #[schemars(description = "Maximum traces (default: 10, max: 50)")]
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SessionArgs {
    #[schemars(description = "Session identifier")]
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ObservationsArgs {
    #[schemars(description = "Trace identifier")]
    pub trace_id: String,
    #[serde(rename = "type")]
    #[schemars(description = "SPAN, GENERATION or EVENT; omit for all")]
    pub observation_type: Option<ObservationType>,
}

fn schema_of<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

static CATALOG: LazyLock<Vec<Tool>> = LazyLock::new(|| {
    ToolName::iter()
        .map(|name| Tool::function(name.as_ref(), name.description(), name.parameters()))
        .collect()
});

/// Tool definitions sent with every tool-enabled model turn
pub fn catalog() -> Vec<Tool> {
    CATALOG.clone()
}

// ============================================================================
// Validated requests
// ============================================================================

/// A tool call that passed name and argument validation
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    GetTrace { trace_id: String },
    SearchTraces(TraceSearch),
    GetSessionTraces { session_id: String },
    GetObservations { trace_id: String, kind: Option<ObservationType> },
}

impl ToolRequest {
    pub fn name(&self) -> ToolName {
        match self {
            Self::GetTrace { .. } => ToolName::GetTrace,
            Self::SearchTraces(_) => ToolName::SearchTraces,
            Self::GetSessionTraces { .. } => ToolName::GetSessionTraces,
            Self::GetObservations { kind, .. } => match kind {
                Some(ObservationType::Span) => ToolName::GetSpans,
                Some(ObservationType::Generation) => ToolName::GetGenerations,
                _ => ToolName::GetObservations,
            },
        }
    }
}

/// Structured tool failure, returned to the model as data
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolInvocationError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{tool} failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error("{tool} timed out after {after_ms}ms")]
    Timeout { tool: String, after_ms: u64 },

    #[error("{tool} unavailable: {reason}")]
    Unavailable { tool: String, reason: String },

    #[error("only one tool call is executed per turn; call {name} was not run")]
    NotExecuted { name: String },
}

impl ToolInvocationError {
    /// Payload sent back to the model in the tool message
    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "detail": self,
                "message": self.to_string(),
            }
        })
    }
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, raw: &str) -> Result<T, ToolInvocationError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| ToolInvocationError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn require_id(tool: ToolName, field: &str, value: String) -> Result<String, ToolInvocationError> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ToolInvocationError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("{} must not be empty", field),
        });
    }
    Ok(value)
}

fn parse_time(tool: ToolName, field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, ToolInvocationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            DateTime::parse_from_rfc3339(v.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ToolInvocationError::InvalidArguments {
                    tool: tool.to_string(),
                    reason: format!("{} is not an RFC 3339 timestamp: {}", field, e),
                })
        })
        .transpose()
}

/// Check a model-issued call against the catalog before anything runs.
pub fn validate(call: &ToolCall) -> Result<ToolRequest, ToolInvocationError> {
    let name = ToolName::from_str(&call.function.name).map_err(|_| ToolInvocationError::UnknownTool {
        name: call.function.name.clone(),
    })?;
    let raw = call.function.arguments.as_str();

    match name {
        ToolName::GetTrace | ToolName::GetSpans | ToolName::GetGenerations => {
            let args: TraceIdArgs = parse_args(name, raw)?;
            let trace_id = require_id(name, "trace_id", args.trace_id)?;
            Ok(match name {
                ToolName::GetSpans => ToolRequest::GetObservations {
                    trace_id,
                    kind: Some(ObservationType::Span),
                },
                ToolName::GetGenerations => ToolRequest::GetObservations {
                    trace_id,
                    kind: Some(ObservationType::Generation),
                },
                _ => ToolRequest::GetTrace { trace_id },
            })
        }
        ToolName::SearchTraces => {
            let args: SearchTracesArgs = parse_args(name, raw)?;
            let limit = args.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
            if limit == 0 || limit > MAX_SEARCH_LIMIT {
                return Err(ToolInvocationError::InvalidArguments {
                    tool: name.to_string(),
                    reason: format!("limit must be between 1 and {}", MAX_SEARCH_LIMIT),
                });
            }
            let (from, to) = match args.time_range {
                Some(range) => (
                    parse_time(name, "time_range.from", range.from)?,
                    parse_time(name, "time_range.to", range.to)?,
                ),
                None => (None, None),
            };
            if let (Some(f), Some(t)) = (from, to)
                && f > t
            {
                return Err(ToolInvocationError::InvalidArguments {
                    tool: name.to_string(),
                    reason: "time_range.from is after time_range.to".into(),
                });
            }
            let query = args.query.trim().to_string();
            Ok(ToolRequest::SearchTraces(TraceSearch {
                query: (!query.is_empty()).then_some(query),
                from,
                to,
                limit,
            }))
        }
        ToolName::GetSessionTraces => {
            let args: SessionArgs = parse_args(name, raw)?;
            Ok(ToolRequest::GetSessionTraces {
                session_id: require_id(name, "session_id", args.session_id)?,
            })
        }
        ToolName::GetObservations => {
            let args: ObservationsArgs = parse_args(name, raw)?;
            Ok(ToolRequest::GetObservations {
                trace_id: require_id(name, "trace_id", args.trace_id)?,
                kind: args.observation_type,
            })
        }
    }
}
