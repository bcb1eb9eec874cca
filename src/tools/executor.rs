// src/tools/executor.rs
// Runs validated tool calls against the trace backend

use super::{ToolInvocationError, ToolRequest, validate};
use crate::circuit_breaker::{CircuitBreaker, Dependency};
use crate::evidence::{BackendError, TraceBackend};
use crate::llm::ToolCall;
use crate::retry::RetryPolicy;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ToolExecutor {
    backend: Option<Arc<dyn TraceBackend>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    max_output_chars: usize,
}

impl ToolExecutor {
    pub fn new(
        backend: Option<Arc<dyn TraceBackend>>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        timeout: Duration,
        max_output_chars: usize,
    ) -> Self {
        Self {
            backend,
            breaker,
            retry,
            timeout,
            max_output_chars,
        }
    }

    /// Validate and run one call. Every failure comes back as a
    /// `ToolInvocationError` so it can be handed to the model as data.
    pub async fn execute(&self, call: &ToolCall) -> Result<Value, ToolInvocationError> {
        let request = validate(call)?;
        let tool = request.name().to_string();

        let Some(backend) = &self.backend else {
            return Err(ToolInvocationError::Unavailable {
                tool,
                reason: "no trace backend configured".into(),
            });
        };
        if !self.breaker.is_available(Dependency::TraceBackend) {
            warn!(tool = %tool, "Trace backend circuit open, refusing tool call");
            return Err(ToolInvocationError::Unavailable {
                tool,
                reason: "trace backend circuit open".into(),
            });
        }

        let start = Instant::now();
        let attempt = self.retry.run(
            &tool,
            || dispatch(backend.as_ref(), &request),
            BackendError::is_transient,
        );
        let result = tokio::time::timeout(self.timeout, attempt).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(value)) => {
                self.breaker.record_success(Dependency::TraceBackend);
                info!(tool = %tool, elapsed_ms, "Tool call succeeded");
                Ok(self.truncate(value))
            }
            Ok(Err(BackendError::NotFound(what))) => {
                self.breaker.record_success(Dependency::TraceBackend);
                debug!(tool = %tool, "Tool target not found");
                Err(ToolInvocationError::Execution {
                    tool,
                    reason: format!("not found: {}", what),
                })
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(Dependency::TraceBackend);
                warn!(tool = %tool, error = %e, elapsed_ms, "Tool call failed");
                Err(ToolInvocationError::Execution {
                    tool,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.breaker.record_failure(Dependency::TraceBackend);
                warn!(tool = %tool, timeout_ms = self.timeout.as_millis() as u64, "Tool call timed out");
                Err(ToolInvocationError::Timeout {
                    tool,
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Cap the serialized size of a tool payload
    fn truncate(&self, value: Value) -> Value {
        let text = value.to_string();
        let chars = text.chars().count();
        if chars <= self.max_output_chars {
            return value;
        }
        let content: String = text.chars().take(self.max_output_chars).collect();
        json!({
            "truncated": true,
            "original_chars": chars,
            "content": content,
        })
    }
}

async fn dispatch(backend: &dyn TraceBackend, request: &ToolRequest) -> Result<Value, BackendError> {
    match request {
        ToolRequest::GetTrace { trace_id } => backend.get_trace(trace_id).await,
        ToolRequest::SearchTraces(search) => backend.search_traces(search).await,
        ToolRequest::GetSessionTraces { session_id } => backend.get_session(session_id).await,
        ToolRequest::GetObservations { trace_id, kind } => backend.get_observations(trace_id, *kind).await,
    }
}
