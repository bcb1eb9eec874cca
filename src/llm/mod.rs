// src/llm/mod.rs
// Reasoning-model client layer

mod client;
mod http_client;
mod openai_compat;
mod provider;
mod types;

pub use client::OpenAiCompatClient;
pub use http_client::LlmHttpClient;
pub use openai_compat::{ChatRequest, parse_chat_response};
pub use provider::LlmClient;
pub use types::{ChatResult, FunctionCall, FunctionDef, Message, Tool, ToolCall, Usage};
