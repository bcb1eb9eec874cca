// src/config/file.rs
// File-based configuration from ~/.debug-agent/config.toml

use crate::circuit_breaker::BreakerSettings;
use crate::error::{Result, TriageError};
use crate::evidence::{SourceKind, SourceLimits};
use crate::fusion::WeightTable;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// tracing level: error, warn, info, debug, trace
    pub log_level: String,
    pub llm: LlmConfig,
    pub classifier: ClassifierConfig,
    pub fusion: FusionConfig,
    pub trace_backend: TraceBackendConfig,
    pub reasoning: ReasoningConfig,
    pub validator: ValidatorConfig,
    pub pipeline: PipelineConfig,
    pub breaker: BreakerConfig,
    pub feedback: FeedbackConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            llm: LlmConfig::default(),
            classifier: ClassifierConfig::default(),
            fusion: FusionConfig::default(),
            trace_backend: TraceBackendConfig::default(),
            reasoning: ReasoningConfig::default(),
            validator: ValidatorConfig::default(),
            pipeline: PipelineConfig::default(),
            breaker: BreakerConfig::default(),
            feedback: FeedbackConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Reasoning model endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Set false to run rules-only with immediate escalation
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 4096,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub rule_timeout_ms: u64,
    pub fallback_timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rule_timeout_ms: 50,
            fallback_timeout_ms: 10_000,
        }
    }
}

/// One evidence source endpoint. Unset limits fall back to the kind's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_items: Option<usize>,
}

impl SourceConfig {
    pub fn limits(&self, kind: SourceKind) -> SourceLimits {
        let (timeout_ms, max_items) = default_limits(kind);
        SourceLimits {
            timeout: Duration::from_millis(self.timeout_ms.unwrap_or(timeout_ms)),
            max_items: self.max_items.unwrap_or(max_items),
        }
    }
}

/// Per-kind (timeout_ms, max_items)
fn default_limits(kind: SourceKind) -> (u64, usize) {
    match kind {
        SourceKind::Case => (2_000, 5),
        SourceKind::Code => (2_000, 10),
        SourceKind::Pattern => (1_000, 3),
        SourceKind::Trace => (3_000, 6),
        SourceKind::Config => (1_000, 5),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub case: SourceConfig,
    pub code: SourceConfig,
    pub pattern: SourceConfig,
    pub trace: SourceConfig,
    pub config: SourceConfig,
}

impl SourcesConfig {
    pub fn get(&self, kind: SourceKind) -> &SourceConfig {
        match kind {
            SourceKind::Case => &self.case,
            SourceKind::Code => &self.code,
            SourceKind::Pattern => &self.pattern,
            SourceKind::Trace => &self.trace,
            SourceKind::Config => &self.config,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Bearer token sent to knowledge-base endpoints
    pub api_key: Option<String>,
    pub weights: WeightTable,
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceBackendConfig {
    pub base_url: Option<String>,
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for TraceBackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            public_key: None,
            secret_key: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub max_tool_rounds: usize,
    pub model_call_timeout_secs: u64,
    pub tool_timeout_ms: u64,
    pub tool_retry_attempts: u32,
    pub tool_retry_base_ms: u64,
    pub max_tool_output_chars: usize,
    /// Fused items serialized into the first prompt
    pub max_context_items: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            model_call_timeout_secs: 60,
            tool_timeout_ms: 5_000,
            tool_retry_attempts: 3,
            tool_retry_base_ms: 200,
            max_tool_output_chars: 8_000,
            max_context_items: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Below this root-cause confidence the fix is forced to `escalate`
    pub confidence_threshold: f64,
    /// Multiplier applied to confidence when citations cannot be verified
    pub hallucination_penalty: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            hallucination_penalty: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wall-clock budget for one analysis
    pub deadline_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { deadline_secs: 180 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            failure_threshold: settings.failure_threshold,
            failure_window_secs: settings.failure_window.as_secs(),
            cooldown_secs: settings.cooldown.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// JSONL file receiving (report, analysis, transcript) records
    pub path: Option<PathBuf>,
    pub queue_capacity: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Analyses kept in memory for GET /api/v1/analysis/{id}
    pub history_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            history_capacity: 500,
        }
    }
}

impl AppConfig {
    /// Load config from ~/.debug-agent/config.toml, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Load an explicitly requested config file; unlike [`AppConfig::load`]
    /// a missing or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TriageError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&contents)
            .map_err(|e| TriageError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// ~/.debug-agent
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".debug-agent")
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker.failure_threshold.max(1),
            failure_window: Duration::from_secs(self.breaker.failure_window_secs),
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
        }
    }

    pub fn tool_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reasoning.tool_retry_attempts,
            Duration::from_millis(self.reasoning.tool_retry_base_ms),
        )
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline.deadline_secs)
    }
}
