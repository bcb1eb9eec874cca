// src/classifier/mod.rs
// Report classification: rule table first, model fallback second

pub mod rules;
pub mod taxonomy;

pub use rules::{RULES, Rule, RuleInput, match_rules};
pub use taxonomy::{Category, CategoryGroup, render_taxonomy};

use crate::circuit_breaker::{CircuitBreaker, Dependency};
use crate::llm::{LlmClient, Message};
use crate::preprocess::PreparedReport;
use crate::validator::raw::extract_json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a report's category was decided. Exactly one per report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum CategoryDecision {
    Rule { category: Category, rule_id: String },
    Model { category: Category, confidence: f64 },
}

impl CategoryDecision {
    pub fn category(&self) -> Category {
        match self {
            Self::Rule { category, .. } | Self::Model { category, .. } => *category,
        }
    }

    /// Rules are certain; the model reports its own confidence
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Rule { .. } => 1.0,
            Self::Model { confidence, .. } => *confidence,
        }
    }

    pub fn is_rule(&self) -> bool {
        matches!(self, Self::Rule { .. })
    }

    fn unknown() -> Self {
        Self::Model {
            category: Category::Unknown,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FallbackAnswer {
    category: String,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct Classifier {
    llm: Option<Arc<dyn LlmClient>>,
    breaker: CircuitBreaker,
    rule_timeout: Duration,
    fallback_timeout: Duration,
}

impl Classifier {
    pub fn new(
        llm: Option<Arc<dyn LlmClient>>,
        breaker: CircuitBreaker,
        rule_timeout: Duration,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            breaker,
            rule_timeout,
            fallback_timeout,
        }
    }

    /// Classify a report. Never fails: a fallback that cannot answer yields
    /// `Model(UNKNOWN, 0.0)`.
    pub async fn classify(&self, report: &PreparedReport, cancel: &CancellationToken) -> CategoryDecision {
        let bug_id = report.report.bug_id.as_str();

        if let Some(rule) = self.run_rules(report).await {
            info!(bug_id, rule_id = rule.id, category = %rule.category, "Classified by rule");
            return CategoryDecision::Rule {
                category: rule.category,
                rule_id: rule.id.to_string(),
            };
        }

        let decision = self.fallback(report, cancel).await;
        info!(
            bug_id,
            category = %decision.category(),
            confidence = decision.confidence(),
            "Classified by model fallback"
        );
        decision
    }

    async fn run_rules(&self, report: &PreparedReport) -> Option<&'static Rule> {
        let input = RuleInput::from_report(report);
        let task = tokio::task::spawn_blocking(move || match_rules(&input));
        match tokio::time::timeout(self.rule_timeout, task).await {
            Ok(Ok(rule)) => rule,
            Ok(Err(e)) => {
                warn!(error = %e, "Rule evaluation task failed");
                None
            }
            Err(_) => {
                warn!(timeout_ms = self.rule_timeout.as_millis() as u64, "Rule evaluation timed out");
                None
            }
        }
    }

    async fn fallback(&self, report: &PreparedReport, cancel: &CancellationToken) -> CategoryDecision {
        let Some(llm) = &self.llm else {
            debug!("No model configured, skipping classification fallback");
            return CategoryDecision::unknown();
        };
        if !self.breaker.is_available(Dependency::Model) {
            warn!("Model circuit open, skipping classification fallback");
            return CategoryDecision::unknown();
        }

        let start = Instant::now();
        let call = tokio::time::timeout(self.fallback_timeout, llm.chat(fallback_messages(report), None));
        let result = tokio::select! {
            _ = cancel.cancelled() => return CategoryDecision::unknown(),
            r = call => r,
        };

        match result {
            Ok(Ok(response)) => {
                self.breaker.record_success(Dependency::Model);
                let content = response.content.unwrap_or_default();
                debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Fallback answered");
                parse_fallback(&content).unwrap_or_else(|| {
                    warn!("Fallback answer did not name a known category");
                    CategoryDecision::unknown()
                })
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(Dependency::Model);
                warn!(error = %e, "Classification fallback failed");
                CategoryDecision::unknown()
            }
            Err(_) => {
                self.breaker.record_failure(Dependency::Model);
                warn!(
                    timeout_ms = self.fallback_timeout.as_millis() as u64,
                    "Classification fallback timed out"
                );
                CategoryDecision::unknown()
            }
        }
    }
}

fn fallback_messages(report: &PreparedReport) -> Vec<Message> {
    let system = format!(
        "You classify backend incident reports.\n\
         Choose exactly one leaf category from this taxonomy:\n\n{}\n\
         Respond with JSON only: {{\"category\": \"GROUP.leaf\", \"confidence\": <0.0-1.0>}}",
        render_taxonomy()
    );

    let info = &report.report.error_info;
    let mut user = format!("Error message: {}\n", info.error_message);
    if let Some(code) = info.error_code.as_deref() {
        user.push_str(&format!("Error code: {}\n", code));
    }
    if let Some(t) = report.stack.exception_type.as_deref() {
        user.push_str(&format!("Exception: {}\n", t));
    }
    let frames: Vec<String> = report
        .stack
        .business_frames()
        .take(3)
        .map(|f| match (f.line, f.function.as_deref()) {
            (Some(line), Some(func)) => format!("{}:{} in {}", f.file, line, func),
            (Some(line), None) => format!("{}:{}", f.file, line),
            (None, _) => f.file.clone(),
        })
        .collect();
    if !frames.is_empty() {
        user.push_str(&format!("Top frames: {}\n", frames.join("; ")));
    }
    if !report.keywords.is_empty() {
        user.push_str(&format!("Keywords: {}\n", report.keywords.join(", ")));
    }
    if let Some(d) = report.report.description() {
        user.push_str(&format!("Description: {}\n", d));
    }

    vec![Message::system(system), Message::user(user)]
}

/// A bare group name or unknown label does not count as an answer.
fn parse_fallback(content: &str) -> Option<CategoryDecision> {
    let value = extract_json(content)?;
    let answer: FallbackAnswer = serde_json::from_value(value).ok()?;
    let category = Category::parse_lenient(&answer.category)?;
    let confidence = answer.confidence.unwrap_or(0.0);
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Some(CategoryDecision::Model {
        category,
        confidence,
    })
}
