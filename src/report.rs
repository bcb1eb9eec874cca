// src/report.rs
// Canonical incident report accepted by the engine

use crate::error::{Result, TriageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

/// Upper bound on a stack trace accepted at the boundary.
const MAX_STACK_TRACE_BYTES: usize = 256 * 1024;
/// Upper bound on attached log lines.
const MAX_RELATED_LOGS: usize = 2_000;
/// Upper bound on a caller-supplied bug id.
const MAX_BUG_ID_LEN: usize = 128;

/// Where a report came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReportSource {
    Alert,
    Ticket,
    #[default]
    Manual,
    Api,
}

/// Incident severity, P0 being the most urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Severity {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

/// Deployment the failure was observed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub pod_name: Option<String>,
}

fn default_service() -> String {
    "unknown-service".to_string()
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            service: default_service(),
            version: None,
            region: None,
            pod_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub error_code: Option<String>,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Free-form context attached by the reporter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportContext {
    #[serde(default)]
    pub client_info: Option<serde_json::Value>,
    #[serde(default)]
    pub request_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub response_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub user_description: Option<String>,
}

/// An incident report in canonical form.
///
/// Ingestion adapters produce this shape; the engine only reads it. Call
/// [`BugReport::accept`] at the boundary to validate it and assign a stable
/// `bug_id` when the adapter did not provide one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    #[serde(default)]
    pub bug_id: String,
    #[serde(default)]
    pub source: ReportSource,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub environment: Environment,
    pub error_info: ErrorInfo,
    #[serde(default)]
    pub context: ReportContext,
    #[serde(default)]
    pub related_logs: Vec<String>,
    #[serde(default)]
    pub reproduce_steps: Vec<String>,
}

impl BugReport {
    /// Minimal report carrying only an error message
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error_info: ErrorInfo {
                error_message: message.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_stack_trace(mut self, stack: impl Into<String>) -> Self {
        self.error_info.stack_trace = Some(stack.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.error_info.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.context.user_description = Some(description.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.related_logs = logs;
        self
    }

    /// Check structural constraints that make a report unusable.
    pub fn validate(&self) -> Result<()> {
        if self.error_info.error_message.trim().is_empty() {
            return Err(TriageError::Validation(
                "error_info.error_message must not be empty".into(),
            ));
        }
        if self.bug_id.len() > MAX_BUG_ID_LEN {
            return Err(TriageError::Validation(format!(
                "bug_id exceeds {} characters",
                MAX_BUG_ID_LEN
            )));
        }
        if self.bug_id.chars().any(|c| c.is_control() || c == '/') {
            return Err(TriageError::Validation(
                "bug_id contains control characters or '/'".into(),
            ));
        }
        if let Some(stack) = &self.error_info.stack_trace
            && stack.len() > MAX_STACK_TRACE_BYTES
        {
            return Err(TriageError::Validation(format!(
                "stack_trace exceeds {} bytes",
                MAX_STACK_TRACE_BYTES
            )));
        }
        if self.related_logs.len() > MAX_RELATED_LOGS {
            return Err(TriageError::Validation(format!(
                "related_logs has {} entries (max {})",
                self.related_logs.len(),
                MAX_RELATED_LOGS
            )));
        }
        Ok(())
    }

    /// Validate and freeze the report for analysis.
    ///
    /// A missing `bug_id` is derived from the report content, so the same
    /// report always receives the same identifier.
    pub fn accept(mut self) -> Result<Self> {
        self.validate()?;
        if self.bug_id.trim().is_empty() {
            self.bug_id = format!("BUG-{}", &self.content_digest()[..12]);
        }
        Ok(self)
    }

    /// Hex sha256 of the canonical JSON form
    pub fn content_digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.error_info
            .trace_id
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.error_info
            .stack_trace
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn description(&self) -> Option<&str> {
        self.context
            .user_description
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}
