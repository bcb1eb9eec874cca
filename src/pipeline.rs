// src/pipeline.rs
// Orchestrates one analysis: classify, fuse, reason, validate, record

use crate::analysis::AnalysisResult;
use crate::circuit_breaker::{CircuitBreaker, Dependency};
use crate::classifier::Classifier;
use crate::config::AppConfig;
use crate::error::{Result, TriageError};
use crate::evidence::{
    EvidenceSource, HttpEvidenceSource, LangfuseClient, SourceKind, TraceBackend, TraceEvidenceSource,
};
use crate::feedback::{FeedbackRecord, FeedbackRecorder, FeedbackSink, JsonlFeedbackSink};
use crate::fusion::FusionEngine;
use crate::llm::{LlmClient, OpenAiCompatClient};
use crate::preprocess::PreparedReport;
use crate::reasoning::{LoopSettings, ReasoningLoop};
use crate::report::BugReport;
use crate::tools::ToolExecutor;
use crate::validator::{AnalysisInputs, ResultValidator, ValidatorSettings};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// What the analyzer is wired to, for `/health` and `check-config`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerInfo {
    pub model: Option<String>,
    pub sources: Vec<SourceKind>,
    pub trace_backend: bool,
    pub feedback: bool,
    pub open_circuits: Vec<String>,
}

/// Collaborators injected into an [`Analyzer`]. Everything is optional:
/// a missing model means rule-only classification and escalation, missing
/// sources mean an empty fused context.
pub struct AnalyzerBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    sources: Vec<Arc<dyn EvidenceSource>>,
    trace_backend: Option<Arc<dyn TraceBackend>>,
    feedback: Option<Arc<dyn FeedbackSink>>,
}

impl AnalyzerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            sources: Vec::new(),
            trace_backend: None,
            feedback: None,
        }
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn source(mut self, source: Arc<dyn EvidenceSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Serves the reasoning loop's tools; does not add a fusion source
    pub fn trace_backend(mut self, backend: Arc<dyn TraceBackend>) -> Self {
        self.trace_backend = Some(backend);
        self
    }

    pub fn feedback_sink(mut self, sink: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(sink);
        self
    }

    /// Wire the components. Spawns the feedback worker, so call it inside
    /// a tokio runtime when a sink is set.
    pub fn build(self) -> Analyzer {
        let config = self.config;
        let breaker = CircuitBreaker::with_settings(config.breaker_settings());
        let llm = self.llm.filter(|_| config.llm.enabled);

        let classifier = Classifier::new(
            llm.clone(),
            breaker.clone(),
            Duration::from_millis(config.classifier.rule_timeout_ms),
            Duration::from_millis(config.classifier.fallback_timeout_ms),
        );
        let fusion = FusionEngine::new(self.sources, config.fusion.weights.clone(), breaker.clone());

        let r = &config.reasoning;
        let tools = ToolExecutor::new(
            self.trace_backend.clone(),
            breaker.clone(),
            config.tool_retry_policy(),
            Duration::from_millis(r.tool_timeout_ms),
            r.max_tool_output_chars,
        );
        let model_call_timeout = Duration::from_secs(r.model_call_timeout_secs);
        let reasoning = ReasoningLoop::new(
            llm.clone(),
            tools,
            breaker.clone(),
            LoopSettings {
                max_tool_rounds: r.max_tool_rounds,
                model_call_timeout,
                max_context_items: r.max_context_items,
            },
        );
        let validator = ResultValidator::new(
            llm.clone(),
            breaker.clone(),
            ValidatorSettings {
                confidence_threshold: config.validator.confidence_threshold,
                hallucination_penalty: config.validator.hallucination_penalty,
                model_call_timeout,
            },
        );
        let recorder = self
            .feedback
            .map(|sink| FeedbackRecorder::spawn(sink, config.feedback.queue_capacity));

        Analyzer {
            model: llm.as_ref().map(|l| l.model_name()),
            has_trace_backend: self.trace_backend.is_some(),
            classifier,
            fusion,
            reasoning,
            validator,
            recorder,
            breaker,
            deadline: config.deadline(),
        }
    }
}

/// The analysis core. Holds only read-only collaborators, so one instance
/// serves concurrent requests.
pub struct Analyzer {
    model: Option<String>,
    has_trace_backend: bool,
    classifier: Classifier,
    fusion: FusionEngine,
    reasoning: ReasoningLoop,
    validator: ResultValidator,
    recorder: Option<FeedbackRecorder>,
    breaker: CircuitBreaker,
    deadline: Duration,
}

impl Analyzer {
    pub fn builder(config: AppConfig) -> AnalyzerBuilder {
        AnalyzerBuilder::new(config)
    }

    /// Validate the config, then build the HTTP-backed collaborators it names
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let validation = config.validate();
        for warning in &validation.warnings {
            warn!("{}", warning);
        }
        if !validation.is_valid() {
            return Err(TriageError::Config(validation.errors.join("; ")));
        }

        let mut builder = AnalyzerBuilder::new(config.clone());

        if config.llm.enabled {
            let llm = &config.llm;
            let client = OpenAiCompatClient::new(
                &llm.base_url,
                llm.api_key.clone().unwrap_or_default(),
                llm.model.clone(),
                llm.temperature,
                llm.max_tokens,
                Duration::from_secs(llm.request_timeout_secs),
            );
            builder = builder.llm(Arc::new(client));
        } else {
            info!("Model disabled by configuration");
        }

        for kind in SourceKind::iter().filter(|k| *k != SourceKind::Trace) {
            let source = config.fusion.sources.get(kind);
            let Some(endpoint) = source.endpoint.as_deref() else {
                continue;
            };
            let url = Url::parse(endpoint)
                .map_err(|e| TriageError::Config(format!("fusion.sources.{}.endpoint: {}", kind, e)))?;
            debug!(source = %kind, endpoint = %url, "Configured evidence source");
            builder = builder.source(Arc::new(HttpEvidenceSource::new(
                kind,
                url,
                source.limits(kind),
                config.fusion.api_key.clone(),
            )));
        }

        let tb = &config.trace_backend;
        if let Some(base_url) = tb.base_url.as_deref() {
            let client = LangfuseClient::new(
                base_url,
                tb.public_key.clone().unwrap_or_default(),
                tb.secret_key.clone().unwrap_or_default(),
                Duration::from_millis(tb.timeout_ms),
            )
            .map_err(|e| TriageError::Config(format!("trace_backend.base_url: {}", e)))?;
            let backend: Arc<dyn TraceBackend> = Arc::new(client);
            let limits = config.fusion.sources.get(SourceKind::Trace).limits(SourceKind::Trace);
            builder = builder
                .source(Arc::new(TraceEvidenceSource::new(backend.clone(), limits)))
                .trace_backend(backend);
        }

        if let Some(path) = &config.feedback.path {
            builder = builder.feedback_sink(Arc::new(JsonlFeedbackSink::new(path.clone())));
        }

        Ok(builder.build())
    }

    pub fn info(&self) -> AnalyzerInfo {
        let mut deps = vec![Dependency::Model, Dependency::TraceBackend];
        deps.extend(SourceKind::iter().map(Dependency::Source));
        AnalyzerInfo {
            model: self.model.clone(),
            sources: self.fusion.source_kinds(),
            trace_backend: self.has_trace_backend,
            feedback: self.recorder.is_some(),
            open_circuits: deps
                .into_iter()
                .filter(|d| self.breaker.is_open(*d))
                .map(|d| d.to_string())
                .collect(),
        }
    }

    /// Analyze one report.
    ///
    /// Only a malformed report is an error. Every downstream failure,
    /// including the deadline, comes back as an escalation result.
    pub async fn analyze(&self, report: BugReport) -> Result<AnalysisResult> {
        let report = report.accept()?;
        let start = Instant::now();
        let analysis_id = report.content_digest();
        let prepared = PreparedReport::new(report);
        let bug_id = prepared.report.bug_id.clone();
        info!(bug_id = %bug_id, severity = %prepared.report.severity, "Analysis started");

        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            let deadline = self.deadline;
            let bug_id = bug_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(bug_id = %bug_id, deadline_ms = deadline.as_millis() as u64, "Analysis deadline reached, cancelling");
                cancel.cancel();
            })
        };

        let decision = self.classifier.classify(&prepared, &cancel).await;
        let (fused, retrieval) = self.fusion.fuse(&prepared, decision.category(), &cancel).await;
        let outcome = self.reasoning.run(&prepared, &decision, &fused, &cancel).await;
        let inputs = AnalysisInputs {
            analysis_id: &analysis_id,
            report: &prepared,
            decision: &decision,
            fused: &fused,
            retrieval: &retrieval,
        };
        let result = self.validator.validate(outcome, &inputs, &cancel).await;
        timer.abort();

        info!(
            bug_id = %bug_id,
            category = %result.root_cause.category,
            fix_type = %result.fix_suggestion.fix_type,
            confidence = result.root_cause.confidence,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Analysis complete"
        );

        if let Some(recorder) = &self.recorder {
            recorder.submit(FeedbackRecord::new(prepared.report, result.clone()));
        }
        Ok(result)
    }

    /// Drain queued feedback records
    pub async fn shutdown(self) {
        if let Some(recorder) = self.recorder {
            recorder.shutdown().await;
        }
    }
}
