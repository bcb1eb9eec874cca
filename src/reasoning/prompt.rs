// src/reasoning/prompt.rs
// Prompt assembly for the analysis conversation

use crate::classifier::{CategoryDecision, render_taxonomy};
use crate::fusion::FusedContext;
use crate::llm::Message;
use crate::preprocess::{PreparedReport, error_logs};
use serde_json::{Value, json};

/// Log lines quoted in the first prompt
const MAX_PROMPT_LOGS: usize = 20;
/// Stack frames quoted in the first prompt
const MAX_PROMPT_FRAMES: usize = 8;

pub const OUTPUT_SCHEMA: &str = r#"{
  "summary": "<one or two sentences>",
  "root_cause": {
    "description": "<what went wrong and why>",
    "category": "<GROUP.leaf from the taxonomy>",
    "confidence": <number between 0 and 1>
  },
  "location": {"file": "<path>", "line_start": <int or null>, "line_end": <int or null>, "function": "<name or null>"} or null,
  "fix_suggestion": {
    "type": "code_change" | "config_change" | "rollback" | "escalate",
    "description": "<what to change>",
    "code_diff": "<unified diff or null>",
    "test_verification": "<how to verify the fix>"
  },
  "impact_assessment": {
    "affected_users": "<who is affected>",
    "affected_features": ["<feature>"],
    "urgency": "P0" | "P1" | "P2" | "P3"
  },
  "similar_cases": [{"case_id": "<id from the evidence>", "similarity": <0-1>, "resolution": "<how it was fixed>"}],
  "additional_investigation": ["<next step>"]
}"#;

pub const REPAIR_MODEL_ERROR: &str =
    "The previous request failed. Continue the analysis and reply with either one tool call or the final JSON analysis.";

pub const REPAIR_MALFORMED: &str =
    "Your last reply was not a JSON object. Reply with the final analysis as a single JSON object matching the required schema, and nothing else.";

pub const TOOLS_WITHDRAWN: &str =
    "The tool budget for this analysis is exhausted. Reply now with the final JSON analysis using the evidence you already have.";

pub fn system_prompt() -> String {
    format!(
        "You are an on-call debugging assistant for backend services.\n\
         You receive an incident report, a proposed category, and ranked evidence from a case store, \
         a code index, a pattern library and a tracing backend.\n\n\
         You may call the provided tools, one at a time, to fetch more trace data before answering. \
         Each tool result arrives before your next turn.\n\n\
         When you are ready, reply with a single JSON object and no other text:\n{}\n\n\
         Rules:\n\
         - Cite only case ids and code locations that appear in the evidence or tool results.\n\
         - Use \"escalate\" when you cannot identify a concrete, safe fix.\n\
         - Confidence reflects how well the evidence supports the root cause.\n\n\
         Category taxonomy:\n{}",
        OUTPUT_SCHEMA,
        render_taxonomy()
    )
}

fn evidence_json(fused: &FusedContext, max_items: usize) -> Value {
    let items: Vec<Value> = fused
        .iter()
        .take(max_items)
        .enumerate()
        .map(|(rank, f)| {
            let mut entry = serde_json::to_value(&f.item.payload).unwrap_or(Value::Null);
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("rank".into(), json!(rank + 1));
                obj.insert("score".into(), json!((f.score * 1000.0).round() / 1000.0));
                obj.insert("source".into(), json!(f.item.source));
            }
            entry
        })
        .collect();
    Value::Array(items)
}

/// The first user message: report, category and fused evidence
pub fn report_prompt(report: &PreparedReport, decision: &CategoryDecision, fused: &FusedContext, max_items: usize) -> String {
    let r = &report.report;
    let info = &r.error_info;
    let mut out = String::new();

    out.push_str("## Incident\n");
    out.push_str(&format!("Bug id: {}\n", r.bug_id));
    out.push_str(&format!("Severity: {}\n", r.severity));
    out.push_str(&format!("Service: {}", r.environment.service));
    if let Some(v) = &r.environment.version {
        out.push_str(&format!(" (version {})", v));
    }
    out.push('\n');
    if let Some(code) = &info.error_code {
        out.push_str(&format!("Error code: {}\n", code));
    }
    out.push_str(&format!("Error message: {}\n", info.error_message));
    if let Some(trace_id) = r.trace_id() {
        out.push_str(&format!("Trace id: {}\n", trace_id));
    }
    if let Some(request_id) = info.request_id.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(&format!("Request id: {}\n", request_id));
    }
    if let Some(d) = r.description() {
        out.push_str(&format!("Reporter says: {}\n", d));
    }

    if !report.stack.frames.is_empty() || report.stack.exception_type.is_some() {
        out.push_str("\n## Stack\n");
        if let Some(t) = &report.stack.exception_type {
            out.push_str(&format!("Exception: {}", t));
            if let Some(m) = &report.stack.exception_message {
                out.push_str(&format!(": {}", m));
            }
            out.push('\n');
        }
        for frame in report.stack.frames.iter().take(MAX_PROMPT_FRAMES) {
            let marker = if frame.is_framework { "framework" } else { "app" };
            out.push_str(&format!(
                "- [{}] {}:{} {}\n",
                marker,
                frame.file,
                frame.line.map(|l| l.to_string()).unwrap_or_else(|| "?".into()),
                frame.function.as_deref().unwrap_or_default()
            ));
        }
    }

    let logs = error_logs(&report.logs);
    if !logs.is_empty() {
        out.push_str("\n## Error logs\n");
        for line in logs.iter().take(MAX_PROMPT_LOGS) {
            out.push_str(line);
            out.push('\n');
        }
    }

    if !r.reproduce_steps.is_empty() {
        out.push_str("\n## Reproduction\n");
        for (i, step) in r.reproduce_steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
    }

    out.push_str("\n## Proposed category\n");
    match decision {
        CategoryDecision::Rule { category, rule_id } => {
            out.push_str(&format!("{} (matched rule {})\n", category, rule_id));
        }
        CategoryDecision::Model { category, confidence } => {
            out.push_str(&format!("{} (model guess, confidence {:.2})\n", category, confidence));
        }
    }

    out.push_str("\n## Evidence\n");
    if fused.is_empty() {
        out.push_str("No evidence sources returned results. Use the tools or reason from the report alone.\n");
    } else {
        out.push_str(&evidence_json(fused, max_items).to_string());
        out.push('\n');
    }
    out
}

pub fn initial_messages(
    report: &PreparedReport,
    decision: &CategoryDecision,
    fused: &FusedContext,
    max_items: usize,
) -> Vec<Message> {
    vec![
        Message::system(system_prompt()),
        Message::user(report_prompt(report, decision, fused, max_items)),
    ]
}

/// Follow-up after the final answer failed schema validation
pub fn schema_repair(problem: &str) -> String {
    format!(
        "Your analysis did not match the required schema: {}\n\
         Reply again with the complete JSON object matching this schema, and nothing else:\n{}",
        problem, OUTPUT_SCHEMA
    )
}
