// src/config/env.rs
// Environment overrides and configuration validation

use super::file::AppConfig;
use crate::evidence::SourceKind;
use strum::IntoEnumIterator;
use tracing::{debug, info};
use url::Url;

/// Environment variables read on startup, after `.env` files are loaded.
///
/// Values are fetched through a lookup function so tests can supply a map
/// instead of touching the process environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    /// DEBUG_AGENT_API_KEY or OPENAI_API_KEY
    pub api_key: Option<String>,
    /// OPENAI_BASE_URL
    pub base_url: Option<String>,
    /// LLM_MODEL
    pub model: Option<String>,
    /// DEBUG_AGENT_TRACE_URL
    pub trace_url: Option<String>,
    /// LANGFUSE_PUBLIC_KEY
    pub trace_public_key: Option<String>,
    /// LANGFUSE_SECRET_KEY
    pub trace_secret_key: Option<String>,
    /// DEBUG_AGENT_KB_API_KEY
    pub kb_api_key: Option<String>,
    /// DEBUG_AGENT_LOG_LEVEL
    pub log_level: Option<String>,
    /// DEBUG_AGENT_DISABLE_LLM
    pub disable_llm: bool,
}

impl EnvOverrides {
    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            api_key: read("DEBUG_AGENT_API_KEY").or_else(|| read("OPENAI_API_KEY")),
            base_url: read("OPENAI_BASE_URL"),
            model: read("LLM_MODEL"),
            trace_url: read("DEBUG_AGENT_TRACE_URL"),
            trace_public_key: read("LANGFUSE_PUBLIC_KEY"),
            trace_secret_key: read("LANGFUSE_SECRET_KEY"),
            kb_api_key: read("DEBUG_AGENT_KB_API_KEY"),
            log_level: read("DEBUG_AGENT_LOG_LEVEL"),
            disable_llm: read("DEBUG_AGENT_DISABLE_LLM")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
        }
    }

    /// Overlay onto a file-loaded config. Environment wins.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(key) = &self.api_key {
            config.llm.api_key = Some(key.clone());
        }
        if let Some(url) = &self.base_url {
            config.llm.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            config.llm.model = model.clone();
        }
        if let Some(url) = &self.trace_url {
            config.trace_backend.base_url = Some(url.clone());
        }
        if let Some(key) = &self.trace_public_key {
            config.trace_backend.public_key = Some(key.clone());
        }
        if let Some(key) = &self.trace_secret_key {
            config.trace_backend.secret_key = Some(key.clone());
        }
        if let Some(key) = &self.kb_api_key {
            config.fusion.api_key = Some(key.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if self.disable_llm {
            info!("DEBUG_AGENT_DISABLE_LLM is set, model calls disabled (rules and escalation only)");
            config.llm.enabled = false;
        }
        debug!(
            api_key = self.api_key.is_some(),
            trace_backend = self.trace_url.is_some(),
            "Applied environment overrides"
        );
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Result of validating a configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }

        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {}", warn));
            }
        }

        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

fn check_url(validation: &mut ConfigValidation, label: &str, value: &str) {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => validation.add_error(format!("{} has unsupported scheme '{}'", label, url.scheme())),
        Err(e) => validation.add_error(format!("{} is not a valid URL ({}): {}", label, e, value)),
    }
}

impl AppConfig {
    /// Validate the configuration
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.llm.enabled {
            check_url(&mut validation, "llm.base_url", &self.llm.base_url);
            if self.llm.api_key.is_none() {
                validation.add_warning(
                    "No model API key configured. Set OPENAI_API_KEY or DEBUG_AGENT_API_KEY.",
                );
            }
        } else {
            validation.add_warning("Model calls disabled; every analysis will escalate.");
        }

        let weights = &self.fusion.weights;
        let all: Vec<f64> = SourceKind::iter().map(|k| weights.weight(k)).collect();
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            validation.add_error("fusion.weights must be finite and non-negative");
        } else if all.iter().all(|w| *w == 0.0) {
            validation.add_warning("All fusion weights are zero; sources will be weighted uniformly");
        }

        let mut configured = 0;
        for kind in SourceKind::iter().filter(|k| *k != SourceKind::Trace) {
            let source = self.fusion.sources.get(kind);
            if let Some(endpoint) = &source.endpoint {
                configured += 1;
                check_url(&mut validation, &format!("fusion.sources.{}.endpoint", kind), endpoint);
            }
            if source.limits(kind).max_items == 0 {
                validation.add_error(format!("fusion.sources.{}.max_items must be at least 1", kind));
            }
        }

        match &self.trace_backend.base_url {
            Some(url) => {
                configured += 1;
                check_url(&mut validation, "trace_backend.base_url", url);
                if self.trace_backend.public_key.is_none() || self.trace_backend.secret_key.is_none() {
                    validation.add_warning(
                        "Trace backend configured without LANGFUSE_PUBLIC_KEY/LANGFUSE_SECRET_KEY",
                    );
                }
            }
            None => validation.add_warning("No trace backend configured; trace tools will report errors"),
        }
        if configured == 0 {
            validation.add_warning("No evidence sources configured; analyses will run without context");
        }

        let threshold = self.validator.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            validation.add_error(format!(
                "validator.confidence_threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        let penalty = self.validator.hallucination_penalty;
        // 1.0 would leave flagged answers at their unflagged confidence
        if !(0.0..1.0).contains(&penalty) {
            validation.add_error(format!(
                "validator.hallucination_penalty must be within [0, 1), got {}",
                penalty
            ));
        }

        if self.reasoning.max_tool_rounds == 0 {
            validation.add_error("reasoning.max_tool_rounds must be at least 1");
        }
        if self.pipeline.deadline_secs == 0 {
            validation.add_error("pipeline.deadline_secs must be at least 1");
        }
        if self.feedback.queue_capacity == 0 {
            validation.add_error("feedback.queue_capacity must be at least 1");
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            validation.add_warning(format!("Unknown log_level '{}', using info", self.log_level));
        }

        validation
    }
}
