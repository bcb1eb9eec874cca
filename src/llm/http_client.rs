// src/llm/http_client.rs
// Shared HTTP client for the model endpoint

use crate::retry::RetryPolicy;
use anyhow::{Result, anyhow};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Attempts per model request, the first one included
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 500;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// One failed POST to the model endpoint
#[derive(Debug, Error)]
pub enum ModelHttpError {
    #[error("API error {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ModelHttpError {
    /// 429, 5xx, and requests that never reached the model
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            Self::Transport(e) => e.is_connect() || e.is_timeout(),
        }
    }
}

/// HTTP client for the model endpoint; transient failures go through a
/// [`RetryPolicy`]
pub struct LlmHttpClient {
    client: Client,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl LlmHttpClient {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            request_timeout,
            connect_timeout,
            retry: RetryPolicy::new(DEFAULT_MAX_ATTEMPTS, Duration::from_millis(DEFAULT_BASE_BACKOFF_MS)),
        }
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self::new(
            request_timeout,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS).min(request_timeout),
        )
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post_once(&self, url: &str, api_key: &str, body: String) -> Result<String, ModelHttpError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelHttpError::Status { status, body });
        }
        Ok(response.text().await?)
    }

    /// POST a JSON body with Bearer auth and return the response text.
    pub async fn execute_with_retry(&self, request_id: &str, url: &str, api_key: &str, body: String) -> Result<String> {
        self.retry
            .run(
                request_id,
                || self.post_once(url, api_key, body.clone()),
                ModelHttpError::is_transient,
            )
            .await
            .map_err(|e| anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = LlmHttpClient::new(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(client.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(client.retry.base_backoff, Duration::from_millis(DEFAULT_BASE_BACKOFF_MS));
        assert_eq!(client.request_timeout, Duration::from_secs(10));
        assert_eq!(client.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_connect_timeout_never_exceeds_request_timeout() {
        let client = LlmHttpClient::with_request_timeout(Duration::from_secs(3));
        assert_eq!(client.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_status_transience() {
        let status = |code: u16| ModelHttpError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(401).is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_reported() {
        let client = LlmHttpClient::new(Duration::from_millis(500), Duration::from_millis(200))
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));
        let result = client
            .execute_with_retry("test-req", "http://127.0.0.1:9/v1/chat/completions", "key", "{}".into())
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("request failed"), "got: {}", err);
    }
}
