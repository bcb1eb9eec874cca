// src/reasoning/mod.rs
// Bounded tool-calling conversation with the reasoning model

pub mod prompt;
pub mod transcript;

pub use transcript::{Transcript, TranscriptEntry};

use crate::analysis::EscalationReason;
use crate::circuit_breaker::{CircuitBreaker, Dependency};
use crate::classifier::CategoryDecision;
use crate::fusion::FusedContext;
use crate::llm::{ChatResult, LlmClient, Message, Tool, ToolCall};
use crate::preprocess::PreparedReport;
use crate::tools::{self, ToolExecutor, ToolInvocationError};
use crate::validator::raw::extract_json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Tool-call round trips allowed before tools are withdrawn
    pub max_tool_rounds: usize,
    pub model_call_timeout: Duration,
    /// Fused items serialized into the first prompt
    pub max_context_items: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            model_call_timeout: Duration::from_secs(60),
            max_context_items: 20,
        }
    }
}

/// Loop states. Every turn starts in `AwaitingModel`.
#[derive(Debug)]
enum LoopState {
    AwaitingModel,
    ExecutingTool {
        calls: Vec<ToolCall>,
        content: Option<String>,
    },
    Done(String),
    Failed(EscalationReason),
}

/// Terminal state of one conversation
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    /// Final answer text, not yet validated. `conversation` is kept so the
    /// validator can ask for a schema repair in context.
    Done {
        content: String,
        conversation: Vec<Message>,
        transcript: Transcript,
    },
    Failed {
        reason: EscalationReason,
        transcript: Transcript,
    },
}

impl LoopOutcome {
    pub fn transcript(&self) -> &Transcript {
        match self {
            Self::Done { transcript, .. } | Self::Failed { transcript, .. } => transcript,
        }
    }

    pub fn failed(reason: EscalationReason) -> Self {
        Self::Failed {
            reason,
            transcript: Transcript::new(),
        }
    }
}

/// How a single model call ended
enum ModelReply {
    Answer(ChatResult),
    Error(String),
    Cancelled,
}

pub struct ReasoningLoop {
    llm: Option<Arc<dyn LlmClient>>,
    tools: ToolExecutor,
    breaker: CircuitBreaker,
    settings: LoopSettings,
}

impl ReasoningLoop {
    pub fn new(
        llm: Option<Arc<dyn LlmClient>>,
        tools: ToolExecutor,
        breaker: CircuitBreaker,
        settings: LoopSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            breaker,
            settings,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Drive the conversation to `Done` or `Failed`.
    ///
    /// Tool round trips never exceed `max_tool_rounds`. After the last round
    /// the model gets one more turn without tools; a tool request on that
    /// turn fails the loop.
    pub async fn run(
        &self,
        report: &PreparedReport,
        decision: &CategoryDecision,
        fused: &FusedContext,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let bug_id = report.report.bug_id.as_str();
        let mut transcript = Transcript::new();

        let Some(llm) = &self.llm else {
            info!(bug_id, "Model disabled, skipping reasoning loop");
            return LoopOutcome::Failed {
                reason: EscalationReason::ModelDisabled,
                transcript,
            };
        };

        let mut messages = prompt::initial_messages(report, decision, fused, self.settings.max_context_items);
        let catalog = tools::catalog();
        let mut state = LoopState::AwaitingModel;
        let mut turn = 0usize;
        // one repair turn per analysis, shared by model errors and malformed answers
        let mut repaired = false;
        let mut withdrawn = false;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    turn += 1;
                    let offer_tools = transcript.tool_rounds < self.settings.max_tool_rounds;
                    if !offer_tools && !withdrawn {
                        withdrawn = true;
                        transcript.push(TranscriptEntry::ToolsWithdrawn { turn });
                        messages.push(Message::user(prompt::TOOLS_WITHDRAWN));
                    }
                    let tools = offer_tools.then(|| catalog.clone());

                    match self.call_model(llm.as_ref(), &messages, tools, cancel).await {
                        ModelReply::Cancelled => LoopState::Failed(EscalationReason::Deadline),
                        ModelReply::Error(error) => {
                            warn!(bug_id, turn, error = %error, "Model call failed");
                            transcript.push(TranscriptEntry::ModelError { turn, error });
                            if repaired {
                                LoopState::Failed(EscalationReason::ModelUnavailable)
                            } else {
                                repaired = true;
                                transcript.push(TranscriptEntry::Repair {
                                    turn,
                                    reason: "model_error".into(),
                                });
                                messages.push(Message::user(prompt::REPAIR_MODEL_ERROR));
                                LoopState::AwaitingModel
                            }
                        }
                        ModelReply::Answer(response) => {
                            let calls = response.requested_tools().to_vec();
                            transcript.push(TranscriptEntry::ModelTurn {
                                turn,
                                tool_calls: calls.len(),
                                final_answer: calls.is_empty(),
                            });

                            if !calls.is_empty() {
                                if offer_tools {
                                    LoopState::ExecutingTool {
                                        calls,
                                        content: response.content,
                                    }
                                } else {
                                    warn!(bug_id, turn, "Model requested a tool after the budget was spent");
                                    LoopState::Failed(EscalationReason::IterationBudget)
                                }
                            } else {
                                let content = response.content.unwrap_or_default();
                                if extract_json(&content).is_some() {
                                    LoopState::Done(content)
                                } else if repaired {
                                    LoopState::Failed(EscalationReason::MalformedOutput)
                                } else {
                                    repaired = true;
                                    debug!(bug_id, turn, "Final answer was not JSON, asking for repair");
                                    transcript.push(TranscriptEntry::Repair {
                                        turn,
                                        reason: "malformed_output".into(),
                                    });
                                    messages.push(Message::assistant(Some(content)));
                                    messages.push(Message::user(prompt::REPAIR_MALFORMED));
                                    LoopState::AwaitingModel
                                }
                            }
                        }
                    }
                }

                LoopState::ExecutingTool { calls, content } => {
                    messages.push(Message::assistant_tool_calls(content, calls.clone()));
                    for (i, call) in calls.iter().enumerate() {
                        transcript.record_call(turn, &call.id, &call.function.name, &call.function.arguments);
                        let result = if i == 0 {
                            tokio::select! {
                                _ = cancel.cancelled() => Err(ToolInvocationError::Execution {
                                    tool: call.function.name.clone(),
                                    reason: "analysis deadline reached".into(),
                                }),
                                r = self.tools.execute(call) => r,
                            }
                        } else {
                            Err(ToolInvocationError::NotExecuted {
                                name: call.function.name.clone(),
                            })
                        };
                        let (ok, output) = match result {
                            Ok(value) => (true, value),
                            Err(e) => {
                                debug!(bug_id, turn, tool = %call.function.name, error = %e, "Tool call returned error");
                                (false, e.to_payload())
                            }
                        };
                        messages.push(Message::tool_result(&call.id, output.to_string()));
                        transcript.record_result(turn, &call.id, &call.function.name, ok, output);
                    }
                    transcript.tool_rounds += 1;
                    info!(bug_id, turn, rounds = transcript.tool_rounds, tool = %calls[0].function.name, "Tool round complete");

                    if cancel.is_cancelled() {
                        LoopState::Failed(EscalationReason::Deadline)
                    } else {
                        LoopState::AwaitingModel
                    }
                }

                LoopState::Done(content) => {
                    info!(bug_id, turns = turn, rounds = transcript.tool_rounds, "Reasoning loop done");
                    return LoopOutcome::Done {
                        content,
                        conversation: messages,
                        transcript,
                    };
                }

                LoopState::Failed(reason) => {
                    warn!(bug_id, turns = turn, reason = %reason, "Reasoning loop failed");
                    return LoopOutcome::Failed { reason, transcript };
                }
            };
        }
    }

    async fn call_model(
        &self,
        llm: &dyn LlmClient,
        messages: &[Message],
        tools: Option<Vec<Tool>>,
        cancel: &CancellationToken,
    ) -> ModelReply {
        if !self.breaker.is_available(Dependency::Model) {
            return ModelReply::Error("model circuit open".into());
        }
        let call = tokio::time::timeout(self.settings.model_call_timeout, llm.chat(messages.to_vec(), tools));
        let result = tokio::select! {
            _ = cancel.cancelled() => return ModelReply::Cancelled,
            r = call => r,
        };
        match result {
            Ok(Ok(response)) => {
                self.breaker.record_success(Dependency::Model);
                ModelReply::Answer(response)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(Dependency::Model);
                ModelReply::Error(e.to_string())
            }
            Err(_) => {
                self.breaker.record_failure(Dependency::Model);
                ModelReply::Error(format!(
                    "model call timed out after {}s",
                    self.settings.model_call_timeout.as_secs()
                ))
            }
        }
    }
}
