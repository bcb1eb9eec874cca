// src/llm/client.rs
// Chat client for any OpenAI-compatible /chat/completions endpoint

use super::http_client::LlmHttpClient;
use super::openai_compat::{ChatRequest, parse_chat_response};
use super::provider::LlmClient;
use super::{ChatResult, Message, Tool};
use anyhow::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{Span, debug, info, instrument};
use uuid::Uuid;

pub struct OpenAiCompatClient {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    http: LlmHttpClient,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: String,
        temperature: f32,
        max_tokens: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: Self::chat_endpoint(base_url),
            api_key,
            model,
            temperature,
            max_tokens,
            http: LlmHttpClient::with_request_timeout(request_timeout),
        }
    }

    /// `https://host/v1` -> `https://host/v1/chat/completions`
    fn chat_endpoint(base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }

    #[instrument(skip(self, messages, tools), fields(request_id, model = %self.model, message_count = messages.len()))]
    async fn complete(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<ChatResult> {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Instant::now();
        Span::current().record("request_id", &request_id);

        info!(
            request_id = %request_id,
            message_count = messages.len(),
            tool_count = tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "Starting model request"
        );

        let request = ChatRequest::new(&self.model, messages)
            .with_tools(tools)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature);
        let body = serde_json::to_string(&request)?;
        debug!(request_id = %request_id, bytes = body.len(), "Model request body built");

        let response_body = self
            .http
            .execute_with_retry(&request_id, &self.endpoint, &self.api_key, body)
            .await?;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let result = parse_chat_response(&response_body, &request_id, duration_ms)?;

        info!(
            request_id = %request_id,
            duration_ms,
            content_len = result.content.as_ref().map(|c| c.len()).unwrap_or(0),
            tool_calls = result.requested_tools().len(),
            total_tokens = result.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
            "Model request complete"
        );
        Ok(result)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<ChatResult> {
        self.complete(messages, tools).await
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(
            OpenAiCompatClient::chat_endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            OpenAiCompatClient::chat_endpoint("http://localhost:8000/v1/"),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            OpenAiCompatClient::chat_endpoint("http://x/v1/chat/completions"),
            "http://x/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_errors() {
        let client = OpenAiCompatClient::new(
            "http://127.0.0.1:9/v1",
            String::new(),
            "test-model".into(),
            0.2,
            256,
            Duration::from_millis(300),
        );
        assert_eq!(client.model_name(), "test-model");
        assert!(client.chat(vec![Message::user("hi")], None).await.is_err());
    }
}
