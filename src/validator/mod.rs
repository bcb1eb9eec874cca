// src/validator/mod.rs
// Turns a loop outcome into the authoritative AnalysisResult

pub mod raw;

use crate::analysis::{
    AnalysisResult, CodeLocation, EscalationReason, FixSuggestion, FixType, ImpactAssessment, RootCause,
    SimilarCase, ValidationReport,
};
use crate::circuit_breaker::{CircuitBreaker, Dependency};
use crate::classifier::{Category, CategoryDecision};
use crate::evidence::EvidencePayload;
use crate::fusion::{FusedContext, RetrievalSummary};
use crate::llm::{LlmClient, Message};
use crate::preprocess::{PreparedReport, same_file};
use crate::reasoning::{LoopOutcome, Transcript, TranscriptEntry, prompt};
use crate::report::Severity;
use raw::{RawAnalysis, parse_analysis};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Confidence reported on escalations produced without a usable answer
pub const ESCALATION_CONFIDENCE: f64 = 0.1;
/// Fused cases copied into `similar_cases` when the model cites none
const FALLBACK_SIMILAR_CASES: usize = 3;

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub confidence_threshold: f64,
    /// Multiplier applied to confidence on unverified citations
    pub hallucination_penalty: f64,
    pub model_call_timeout: Duration,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            hallucination_penalty: 0.5,
            model_call_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything about the request the result envelope needs
pub struct AnalysisInputs<'a> {
    pub analysis_id: &'a str,
    pub report: &'a PreparedReport,
    pub decision: &'a CategoryDecision,
    pub fused: &'a FusedContext,
    pub retrieval: &'a RetrievalSummary,
}

pub struct ResultValidator {
    llm: Option<Arc<dyn LlmClient>>,
    breaker: CircuitBreaker,
    settings: ValidatorSettings,
}

impl ResultValidator {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, breaker: CircuitBreaker, settings: ValidatorSettings) -> Self {
        Self {
            llm,
            breaker,
            settings,
        }
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    /// Always returns a schema-valid result. Failed loops and unrepairable
    /// answers become escalations.
    pub async fn validate(
        &self,
        outcome: LoopOutcome,
        inputs: &AnalysisInputs<'_>,
        cancel: &CancellationToken,
    ) -> AnalysisResult {
        let bug_id = inputs.report.report.bug_id.as_str();
        let (content, conversation, mut transcript) = match outcome {
            LoopOutcome::Failed { reason, transcript } => {
                return self.escalation(reason, transcript, inputs);
            }
            LoopOutcome::Done {
                content,
                conversation,
                transcript,
            } => (content, conversation, transcript),
        };

        let mut report = ValidationReport::default();
        let raw = match parse_analysis(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(bug_id, error = %e, "Model answer violates output schema, requesting repair");
                match self.repair(conversation, &content, &e.to_string(), &mut transcript, cancel).await {
                    Some(raw) => {
                        report.schema_repaired = true;
                        raw
                    }
                    None => return self.escalation(EscalationReason::SchemaViolation, transcript, inputs),
                }
            }
        };

        let result = self.apply_rules(raw, report, transcript, inputs);
        info!(
            bug_id,
            fix_type = %result.fix_suggestion.fix_type,
            confidence = result.root_cause.confidence,
            gated = result.validation.confidence_gated,
            hallucination = result.validation.possible_hallucination,
            "Analysis validated"
        );
        result
    }

    async fn repair(
        &self,
        mut conversation: Vec<Message>,
        content: &str,
        problem: &str,
        transcript: &mut Transcript,
        cancel: &CancellationToken,
    ) -> Option<RawAnalysis> {
        let llm = self.llm.as_ref()?;
        if cancel.is_cancelled() || !self.breaker.is_available(Dependency::Model) {
            return None;
        }

        let turn = transcript.entries.iter().filter(|e| matches!(e, TranscriptEntry::ModelTurn { .. })).count() + 1;
        transcript.push(TranscriptEntry::Repair {
            turn,
            reason: "schema_violation".into(),
        });
        conversation.push(Message::assistant(Some(content.to_string())));
        conversation.push(Message::user(prompt::schema_repair(problem)));

        let call = tokio::time::timeout(self.settings.model_call_timeout, llm.chat(conversation, None));
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            r = call => r,
        };
        match result {
            Ok(Ok(response)) => {
                self.breaker.record_success(Dependency::Model);
                transcript.push(TranscriptEntry::ModelTurn {
                    turn,
                    tool_calls: response.requested_tools().len(),
                    final_answer: true,
                });
                match parse_analysis(response.content.as_deref().unwrap_or_default()) {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        warn!(error = %e, "Repaired answer still violates output schema");
                        None
                    }
                }
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(Dependency::Model);
                transcript.push(TranscriptEntry::ModelError {
                    turn,
                    error: e.to_string(),
                });
                None
            }
            Err(_) => {
                self.breaker.record_failure(Dependency::Model);
                transcript.push(TranscriptEntry::ModelError {
                    turn,
                    error: "schema repair timed out".into(),
                });
                None
            }
        }
    }

    /// Plausibility check, hallucination penalty, confidence gate
    fn apply_rules(
        &self,
        raw: RawAnalysis,
        mut validation: ValidationReport,
        transcript: Transcript,
        inputs: &AnalysisInputs<'_>,
    ) -> AnalysisResult {
        let fused = inputs.fused;
        let report = inputs.report;

        let category = Category::parse_lenient(&raw.root_cause.category)
            .filter(|c| *c != Category::Unknown)
            .unwrap_or_else(|| inputs.decision.category());
        let mut confidence = raw.root_cause.confidence.clamp(0.0, 1.0);

        let known_cases = fused.case_ids();
        for case in &raw.similar_cases {
            if !known_cases.contains(case.case_id.trim()) {
                validation.unverified_citations.push(format!("case:{}", case.case_id.trim()));
            }
        }
        if let Some(loc) = &raw.location {
            let in_code = fused.code_files().iter().any(|f| same_file(f, &loc.file));
            if !in_code && !report.mentions_file(&loc.file) {
                validation.unverified_citations.push(format!("location:{}", loc.file.trim()));
            }
        }
        if !validation.unverified_citations.is_empty() {
            validation.possible_hallucination = true;
            confidence = (confidence * self.settings.hallucination_penalty).clamp(0.0, 1.0);
            warn!(
                bug_id = %report.report.bug_id,
                citations = ?validation.unverified_citations,
                confidence,
                "Model cited evidence absent from the fused context"
            );
        }

        let mut fix = raw.fix_suggestion;
        if confidence < self.settings.confidence_threshold && fix.fix_type != FixType::Escalate {
            info!(
                bug_id = %report.report.bug_id,
                confidence,
                threshold = self.settings.confidence_threshold,
                proposed = %fix.fix_type,
                "Confidence below threshold, forcing escalation"
            );
            fix.fix_type = FixType::Escalate;
            validation.confidence_gated = true;
            validation.escalation_reason = Some(EscalationReason::LowConfidence);
        }

        let location = raw
            .location
            .map(|l| CodeLocation {
                file: l.file.trim().to_string(),
                line_start: l.line_start,
                line_end: l.line_end.or(l.line_start),
                function: l.function.filter(|f| !f.trim().is_empty()),
            })
            .or_else(|| root_frame_location(report));

        let impact = raw.impact_assessment.unwrap_or_default();
        let impact_assessment = ImpactAssessment {
            affected_users: impact
                .affected_users
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| "unknown".into()),
            affected_features: impact.affected_features,
            urgency: impact
                .urgency
                .and_then(|u| Severity::from_str(u.trim()).ok())
                .unwrap_or(report.report.severity),
        };

        let similar_cases = if raw.similar_cases.is_empty() {
            fused_cases(fused)
        } else {
            raw.similar_cases
                .into_iter()
                .map(|c| {
                    let id = c.case_id.trim().to_string();
                    let fused_match = fused
                        .cases()
                        .find(|f| matches!(&f.item.payload, EvidencePayload::CaseMatch { case_id, .. } if *case_id == id));
                    SimilarCase {
                        similarity: c
                            .similarity
                            .filter(|s| s.is_finite())
                            .or(fused_match.map(|f| f.score))
                            .unwrap_or(0.0)
                            .clamp(0.0, 1.0),
                        resolution: c
                            .resolution
                            .or_else(|| fused_match.and_then(case_resolution))
                            .unwrap_or_default(),
                        case_id: id,
                    }
                })
                .collect()
        };

        AnalysisResult {
            analysis_id: inputs.analysis_id.to_string(),
            bug_id: report.report.bug_id.clone(),
            summary: raw.summary.trim().to_string(),
            root_cause: RootCause {
                description: raw.root_cause.description.trim().to_string(),
                category,
                confidence,
            },
            location,
            fix_suggestion: fix,
            impact_assessment,
            similar_cases,
            additional_investigation: raw.additional_investigation,
            category_decision: inputs.decision.clone(),
            validation,
            retrieval_summary: inputs.retrieval.clone(),
            transcript,
        }
    }

    /// Low-confidence result handed to a human
    pub fn escalation(
        &self,
        reason: EscalationReason,
        transcript: Transcript,
        inputs: &AnalysisInputs<'_>,
    ) -> AnalysisResult {
        let report = inputs.report;
        let r = &report.report;
        match reason.cause() {
            Some(cause) => warn!(bug_id = %r.bug_id, reason = %reason, error = %cause, "Escalating analysis"),
            None => info!(bug_id = %r.bug_id, reason = %reason, "Escalating analysis"),
        }

        let mut next = Vec::new();
        if let Some(trace_id) = r.trace_id() {
            next.push(format!("Inspect trace {} in the tracing backend", trace_id));
        }
        if let Some(frame) = report.stack.root_frame() {
            next.push(format!("Review {} around the failing frame", frame.file));
        }
        if !report.logs.is_empty() {
            next.push(format!("Review the {} correlated log lines", report.logs.len()));
        }
        next.push(format!("Check recent deploys and config changes of {}", r.environment.service));

        AnalysisResult {
            analysis_id: inputs.analysis_id.to_string(),
            bug_id: r.bug_id.clone(),
            summary: format!(
                "Automated analysis did not reach a trusted conclusion ({}); escalating for human review.",
                reason
            ),
            root_cause: RootCause {
                description: format!("Unresolved: {}", r.error_info.error_message.trim()),
                category: inputs.decision.category(),
                confidence: ESCALATION_CONFIDENCE,
            },
            location: root_frame_location(report),
            fix_suggestion: FixSuggestion {
                fix_type: FixType::Escalate,
                description: format!("Escalate to the owning team of {} for manual triage.", r.environment.service),
                code_diff: None,
                test_verification: String::new(),
            },
            impact_assessment: ImpactAssessment {
                affected_users: "unknown".into(),
                affected_features: Vec::new(),
                urgency: r.severity,
            },
            similar_cases: fused_cases(inputs.fused),
            additional_investigation: next,
            category_decision: inputs.decision.clone(),
            validation: ValidationReport {
                escalation_reason: Some(reason),
                ..Default::default()
            },
            retrieval_summary: inputs.retrieval.clone(),
            transcript,
        }
    }
}

fn root_frame_location(report: &PreparedReport) -> Option<CodeLocation> {
    report.stack.root_frame().map(|f| CodeLocation {
        file: f.file.clone(),
        line_start: f.line,
        line_end: f.line,
        function: f.function.clone(),
    })
}

fn case_resolution(item: &crate::fusion::FusedItem) -> Option<String> {
    match &item.item.payload {
        EvidencePayload::CaseMatch { resolution, .. } => resolution.clone(),
        _ => None,
    }
}

fn fused_cases(fused: &FusedContext) -> Vec<SimilarCase> {
    fused
        .cases()
        .take(FALLBACK_SIMILAR_CASES)
        .filter_map(|f| match &f.item.payload {
            EvidencePayload::CaseMatch { case_id, .. } => Some(SimilarCase {
                case_id: case_id.clone(),
                similarity: f.score,
                resolution: case_resolution(f).unwrap_or_default(),
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceItem, SourceKind};
    use crate::fusion::FusedItem;
    use crate::llm::{ChatResult, Tool};
    use crate::report::BugReport;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RepairLlm {
        reply: Mutex<Option<String>>,
    }

    #[async_trait]
    impl LlmClient for RepairLlm {
        async fn chat(&self, messages: Vec<Message>, _tools: Option<Vec<Tool>>) -> anyhow::Result<ChatResult> {
            assert!(messages.last().unwrap().content.as_deref().unwrap().contains("did not match"));
            match self.reply.lock().unwrap().take() {
                Some(content) => Ok(ChatResult {
                    content: Some(content),
                    ..Default::default()
                }),
                None => Err(anyhow::anyhow!("no reply")),
            }
        }

        fn model_name(&self) -> String {
            "repair".into()
        }
    }

    fn answer(confidence: f64, fix: &str, cases: &str, file: &str) -> String {
        format!(
            r#"{{"summary": "pool exhausted",
                "root_cause": {{"description": "pool too small", "category": "PERFORMANCE.resource_contention", "confidence": {}}},
                "location": {{"file": "{}", "line_start": 10}},
                "fix_suggestion": {{"type": "{}", "description": "raise pool size"}},
                "similar_cases": {}}}"#,
            confidence, file, fix, cases
        )
    }

    fn fused() -> FusedContext {
        FusedContext {
            items: vec![
                FusedItem {
                    score: 0.7,
                    item: EvidenceItem::new(
                        "CASE-1",
                        SourceKind::Case,
                        0.9,
                        EvidencePayload::CaseMatch {
                            case_id: "CASE-1".into(),
                            title: "pool".into(),
                            root_cause: None,
                            resolution: Some("raised pool size".into()),
                            category: None,
                        },
                    ),
                },
                FusedItem {
                    score: 0.5,
                    item: EvidenceItem::new(
                        "app/db.py:10",
                        SourceKind::Code,
                        0.8,
                        EvidencePayload::CodeMatch {
                            file: "app/db.py".into(),
                            line_start: Some(10),
                            line_end: None,
                            function: None,
                            snippet: String::new(),
                        },
                    ),
                },
            ],
        }
    }

    struct Fixture {
        report: PreparedReport,
        decision: CategoryDecision,
        fused: FusedContext,
        retrieval: RetrievalSummary,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                report: PreparedReport::new(
                    BugReport::from_error("pool exhausted")
                        .with_severity(Severity::P1)
                        .accept()
                        .unwrap(),
                ),
                decision: CategoryDecision::Rule {
                    category: Category::PerfResourceContention,
                    rule_id: "resource_contention".into(),
                },
                fused: fused(),
                retrieval: RetrievalSummary::default(),
            }
        }

        fn inputs(&self) -> AnalysisInputs<'_> {
            AnalysisInputs {
                analysis_id: "an-1",
                report: &self.report,
                decision: &self.decision,
                fused: &self.fused,
                retrieval: &self.retrieval,
            }
        }
    }

    fn done(content: String) -> LoopOutcome {
        LoopOutcome::Done {
            content,
            conversation: vec![Message::user("report")],
            transcript: Transcript::new(),
        }
    }

    fn validator(llm: Option<Arc<dyn LlmClient>>) -> ResultValidator {
        ResultValidator::new(llm, CircuitBreaker::new(), ValidatorSettings::default())
    }

    // ========================================================================
    // Business rules
    // ========================================================================

    #[tokio::test]
    async fn test_trusted_answer_passes_through() {
        let fx = Fixture::new();
        let result = validator(None)
            .validate(
                done(answer(0.8, "config_change", r#"[{"case_id": "CASE-1"}]"#, "app/db.py")),
                &fx.inputs(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.fix_suggestion.fix_type, FixType::ConfigChange);
        assert_eq!(result.root_cause.confidence, 0.8);
        assert!(!result.validation.possible_hallucination);
        assert_eq!(result.similar_cases[0].similarity, 0.7);
        assert_eq!(result.similar_cases[0].resolution, "raised pool size");
        assert_eq!(result.analysis_id, "an-1");
    }

    #[tokio::test]
    async fn test_low_confidence_forces_escalate() {
        let fx = Fixture::new();
        let result = validator(None)
            .validate(
                done(answer(0.3, "code_change", "[]", "app/db.py")),
                &fx.inputs(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.fix_suggestion.fix_type, FixType::Escalate);
        assert!(result.validation.confidence_gated);
        assert_eq!(result.validation.escalation_reason, Some(EscalationReason::LowConfidence));
        assert_eq!(result.root_cause.confidence, 0.3);
    }

    #[tokio::test]
    async fn test_unknown_case_flags_hallucination() {
        let fx = Fixture::new();
        let result = validator(None)
            .validate(
                done(answer(0.9, "code_change", r#"[{"case_id": "CASE-999"}]"#, "app/db.py")),
                &fx.inputs(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.validation.possible_hallucination);
        assert_eq!(result.validation.unverified_citations, vec!["case:CASE-999"]);
        assert!(result.root_cause.confidence < 0.9);
        assert_eq!(result.root_cause.confidence, 0.45);
        // penalized below threshold
        assert_eq!(result.fix_suggestion.fix_type, FixType::Escalate);
    }

    #[tokio::test]
    async fn test_unknown_location_flags_hallucination() {
        let fx = Fixture::new();
        let result = validator(None)
            .validate(
                done(answer(0.9, "code_change", "[]", "lib/other.py")),
                &fx.inputs(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.validation.unverified_citations, vec!["location:lib/other.py"]);
    }

    #[tokio::test]
    async fn test_no_cited_cases_fills_from_context() {
        let fx = Fixture::new();
        let result = validator(None)
            .validate(
                done(answer(0.9, "code_change", "[]", "app/db.py")),
                &fx.inputs(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.similar_cases.len(), 1);
        assert_eq!(result.similar_cases[0].case_id, "CASE-1");
        assert_eq!(result.impact_assessment.urgency, Severity::P1);
    }

    #[tokio::test]
    async fn test_unresolvable_category_keeps_classifier_category() {
        let fx = Fixture::new();
        let text = answer(0.9, "code_change", "[]", "app/db.py").replace("PERFORMANCE.resource_contention", "DATABASE");
        let result = validator(None)
            .validate(done(text), &fx.inputs(), &CancellationToken::new())
            .await;
        assert_eq!(result.root_cause.category, Category::PerfResourceContention);
    }

    // ========================================================================
    // Repair and escalation
    // ========================================================================

    #[tokio::test]
    async fn test_schema_violation_repaired() {
        let fx = Fixture::new();
        let llm: Arc<dyn LlmClient> = Arc::new(RepairLlm {
            reply: Mutex::new(Some(answer(0.8, "rollback", "[]", "app/db.py"))),
        });
        let result = validator(Some(llm))
            .validate(
                done(r#"{"summary": "pool exhausted"}"#.into()),
                &fx.inputs(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.validation.schema_repaired);
        assert_eq!(result.fix_suggestion.fix_type, FixType::Rollback);
        assert!(
            result
                .transcript
                .entries
                .iter()
                .any(|e| matches!(e, TranscriptEntry::Repair { reason, .. } if reason == "schema_violation"))
        );
    }

    #[tokio::test]
    async fn test_failed_repair_escalates() {
        let fx = Fixture::new();
        let llm: Arc<dyn LlmClient> = Arc::new(RepairLlm {
            reply: Mutex::new(Some("still wrong".into())),
        });
        let result = validator(Some(llm))
            .validate(done("{}".into()), &fx.inputs(), &CancellationToken::new())
            .await;
        assert_eq!(result.fix_suggestion.fix_type, FixType::Escalate);
        assert_eq!(result.validation.escalation_reason, Some(EscalationReason::SchemaViolation));
    }

    #[tokio::test]
    async fn test_failed_loop_becomes_escalation() {
        let fx = Fixture::new();
        let outcome = LoopOutcome::Failed {
            reason: EscalationReason::IterationBudget,
            transcript: Transcript::new(),
        };
        let result = validator(None)
            .validate(outcome, &fx.inputs(), &CancellationToken::new())
            .await;
        assert!(result.is_escalation());
        assert_eq!(result.root_cause.confidence, ESCALATION_CONFIDENCE);
        assert_eq!(result.root_cause.category, Category::PerfResourceContention);
        assert_eq!(result.impact_assessment.urgency, Severity::P1);
        assert_eq!(result.similar_cases[0].case_id, "CASE-1");
        assert!(!result.additional_investigation.is_empty());
    }
}
