// src/evidence/backend.rs
// Tracing-log backend client (Langfuse public API)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("trace backend unreachable: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("trace backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("undecodable trace backend response: {0}")]
    Decode(String),

    #[error("invalid trace backend url: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    /// Worth retrying: connect/timeout failures, 429 and 5xx
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Observation kinds recorded by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ObservationType {
    Span,
    Generation,
    Event,
}

/// Filters for listing traces
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSearch {
    /// Matched against the trace name
    pub query: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// Read-only access to recorded traces
#[async_trait]
pub trait TraceBackend: Send + Sync {
    async fn get_trace(&self, trace_id: &str) -> Result<Value, BackendError>;

    async fn search_traces(&self, search: &TraceSearch) -> Result<Value, BackendError>;

    async fn get_session(&self, session_id: &str) -> Result<Value, BackendError>;

    async fn get_observations(
        &self,
        trace_id: &str,
        kind: Option<ObservationType>,
    ) -> Result<Value, BackendError>;
}

/// HTTP client for a Langfuse-compatible public API using basic auth
pub struct LangfuseClient {
    base_url: Url,
    public_key: String,
    secret_key: String,
    client: Client,
}

impl LangfuseClient {
    pub fn new(
        base_url: &str,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(BackendError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base_url.scheme()
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            base_url,
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            client,
        })
    }

    /// Build `<base>/api/public/<segments...>` with each segment escaped
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "public"])
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, BackendError> {
        debug!(url = %url, "Trace backend request");
        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(url.path().to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Transient(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TraceBackend for LangfuseClient {
    #[instrument(skip(self))]
    async fn get_trace(&self, trace_id: &str) -> Result<Value, BackendError> {
        let url = self.endpoint(&["traces", trace_id])?;
        self.get_json(url).await
    }

    #[instrument(skip(self))]
    async fn search_traces(&self, search: &TraceSearch) -> Result<Value, BackendError> {
        let mut url = self.endpoint(&["traces"])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(query) = &search.query {
                pairs.append_pair("name", query);
            }
            if let Some(from) = search.from {
                pairs.append_pair("fromTimestamp", &from.to_rfc3339());
            }
            if let Some(to) = search.to {
                pairs.append_pair("toTimestamp", &to.to_rfc3339());
            }
            pairs.append_pair("limit", &search.limit.max(1).to_string());
        }
        self.get_json(url).await
    }

    #[instrument(skip(self))]
    async fn get_session(&self, session_id: &str) -> Result<Value, BackendError> {
        let url = self.endpoint(&["sessions", session_id])?;
        self.get_json(url).await
    }

    #[instrument(skip(self))]
    async fn get_observations(
        &self,
        trace_id: &str,
        kind: Option<ObservationType>,
    ) -> Result<Value, BackendError> {
        let mut url = self.endpoint(&["observations"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("traceId", trace_id);
            if let Some(kind) = kind {
                pairs.append_pair("type", &kind.to_string());
            }
        }
        self.get_json(url).await
    }
}
