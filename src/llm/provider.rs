// src/llm/provider.rs
// Reasoning-model abstraction

use anyhow::Result;
use async_trait::async_trait;

use super::{ChatResult, Message, Tool};

/// Trait for chat-completion clients. The engine holds one behind an `Arc`
/// and never mutates it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request
    async fn chat(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<ChatResult>;

    /// Model identifier, for logs and the health endpoint
    fn model_name(&self) -> String;
}
