// src/error.rs
// Error types for the triage engine

use thiserror::Error;

/// Main error type for the debug-agent library.
///
/// Only `Validation` is meant to reach a caller of [`crate::Analyzer`].
/// Every other variant is recovered inside the pipeline into degraded data
/// (fewer evidence items, lower confidence, or an escalation).
#[derive(Error, Debug)]
pub enum TriageError {
    #[error("invalid report: {0}")]
    Validation(String),

    #[error("evidence source {kind} timed out after {timeout_ms}ms")]
    SourceTimeout { kind: String, timeout_ms: u64 },

    #[error("evidence source {kind} unavailable: {reason}")]
    SourceUnavailable { kind: String, reason: String },

    #[error("tool invocation failed: {0}")]
    ToolInvocation(String),

    #[error("model call failed: {0}")]
    ModelCall(String),

    #[error("model output violates the analysis schema: {0}")]
    SchemaViolation(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

impl TriageError {
    /// Whether the error is a rejection of caller input rather than a
    /// degraded dependency.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<String> for TriageError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<crate::tools::ToolInvocationError> for TriageError {
    fn from(err: crate::tools::ToolInvocationError) -> Self {
        Self::ToolInvocation(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TriageError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Other(format!("task panicked: {}", err))
        }
    }
}
