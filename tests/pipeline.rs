//! End-to-end analysis runs against scripted collaborators


use debug_agent::analysis::{AnalysisResult, EscalationReason, FixType};
use debug_agent::classifier::{Category, CategoryDecision};
use debug_agent::config::AppConfig;
use debug_agent::evidence::{EvidenceItem, EvidencePayload, SourceKind, SourceOutcome};
use debug_agent::report::BugReport;
use debug_agent::Analyzer;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use test_utils::*;

const STACK_FILE: &str = "app/clients/payments.py";

fn analyzer_with(config: AppConfig, llm: Arc<ScriptedLlm>, sources: Vec<Arc<StaticSource>>) -> Analyzer {
    let mut builder = Analyzer::builder(config)
        .llm(llm)
        .trace_backend(Arc::new(StaticTraceBackend::new()));
    for source in sources {
        builder = builder.source(source);
    }
    builder.build()
}

fn default_sources() -> Vec<Arc<StaticSource>> {
    vec![
        Arc::new(StaticSource::new(SourceKind::Case, vec![case("CASE-1", 0.9), case("CASE-2", 0.4)])),
        Arc::new(StaticSource::new(SourceKind::Code, vec![code(STACK_FILE, 88, 0.7)])),
    ]
}

async fn run_once(turns: Vec<Turn>) -> AnalysisResult {
    let llm = Arc::new(ScriptedLlm::new(turns));
    let analyzer = analyzer_with(test_config(), llm, default_sources());
    analyzer.analyze(rate_limit_report()).await.unwrap()
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn test_repeated_runs_are_byte_identical() {
    let script = || {
        vec![
            Turn::tool("get_trace", json!({"trace_id": "trace-1"})),
            Turn::Answer(answer(0.8, "code_change", &["CASE-1"], STACK_FILE)),
        ]
    };
    let first = run_once(script()).await;
    let second = run_once(script()).await;

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.fix_suggestion.fix_type, FixType::CodeChange);
    assert_eq!(first.transcript.tool_rounds, 1);
    assert!(first.transcript.is_balanced());
    assert!(!first.validation.possible_hallucination);
}

// ============================================================================
// Loop bounds
// ============================================================================

#[tokio::test]
async fn test_tool_rounds_never_exceed_cap() {
    let mut config = test_config();
    config.reasoning.max_tool_rounds = 2;
    let llm = Arc::new(ScriptedLlm::tool_happy(10));
    let backend = Arc::new(StaticTraceBackend::new());
    let analyzer = Analyzer::builder(config)
        .llm(llm.clone())
        .trace_backend(backend.clone())
        .build();

    let result = analyzer.analyze(rate_limit_report()).await.unwrap();

    assert_eq!(result.transcript.tool_rounds, 2);
    assert_eq!(result.transcript.tool_calls().count(), 2);
    assert_eq!(backend.lookups.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(*llm.offered_tools.lock().unwrap(), vec![true, true, false]);
    assert_eq!(result.fix_suggestion.fix_type, FixType::Escalate);
    assert_eq!(result.validation.escalation_reason, Some(EscalationReason::IterationBudget));
}

#[tokio::test]
async fn test_deadline_yields_escalation() {
    let mut config = test_config();
    config.pipeline.deadline_secs = 1;
    let llm = Arc::new(ScriptedLlm::new(vec![Turn::Hang]));
    let analyzer = analyzer_with(config, llm, default_sources());

    let result = tokio::time::timeout(Duration::from_secs(10), analyzer.analyze(rate_limit_report()))
        .await
        .expect("analysis must finish after the deadline")
        .unwrap();

    assert!(result.is_escalation());
    assert_eq!(result.validation.escalation_reason, Some(EscalationReason::Deadline));
    // evidence gathered before the deadline is still reported
    assert!(!result.similar_cases.is_empty());
}

// ============================================================================
// Degradation
// ============================================================================

#[tokio::test]
async fn test_all_sources_failing_still_answers() {
    let llm = Arc::new(ScriptedLlm::new(vec![Turn::Fail, Turn::Fail]));
    let mut builder = Analyzer::builder(test_config()).llm(llm);
    for kind in SourceKind::iter() {
        builder = builder.source(Arc::new(FailingSource(kind)));
    }
    let analyzer = builder.build();

    let result = analyzer.analyze(rate_limit_report()).await.unwrap();

    assert_eq!(result.retrieval_summary.fused_items, 0);
    assert!(
        result
            .retrieval_summary
            .sources
            .iter()
            .all(|s| matches!(s.outcome, SourceOutcome::Failed { .. }) && s.weight == 0.0)
    );
    assert_eq!(result.fix_suggestion.fix_type, FixType::Escalate);
    assert!(result.root_cause.confidence < 0.5);

    // schema-valid: survives a round trip through the public type
    let json = serde_json::to_string(&result).unwrap();
    let parsed: AnalysisResult = serde_json::from_str(&json).unwrap();
    assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
}

#[tokio::test]
async fn test_disabled_model_escalates_with_rule_category() {
    let mut config = test_config();
    config.llm.enabled = false;
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let analyzer = analyzer_with(config, llm.clone(), default_sources());

    let result = analyzer.analyze(rate_limit_report()).await.unwrap();

    assert_eq!(llm.calls(), 0);
    assert_eq!(result.validation.escalation_reason, Some(EscalationReason::ModelDisabled));
    assert_eq!(result.root_cause.category, Category::ApiRateLimited);
    assert_eq!(result.similar_cases[0].case_id, "CASE-1");
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test]
async fn test_rate_limit_rule_skips_model_fallback() {
    let llm = Arc::new(ScriptedLlm::new(vec![Turn::Answer(answer(
        0.8,
        "code_change",
        &["CASE-1"],
        STACK_FILE,
    ))]));
    let analyzer = analyzer_with(test_config(), llm.clone(), default_sources());

    let result = analyzer
        .analyze(BugReport::from_error("rate limit exceeded"))
        .await
        .unwrap();

    assert_eq!(
        result.category_decision,
        CategoryDecision::Rule {
            category: Category::ApiRateLimited,
            rule_id: "rate_limit".into(),
        }
    );
    // the only model call is the reasoning loop's, which offers tools
    assert_eq!(*llm.offered_tools.lock().unwrap(), vec![true]);
}

#[tokio::test]
async fn test_unmatched_report_uses_model_fallback() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Turn::Answer(r#"{"category": "DATA_ERROR.invalid_format", "confidence": 0.7}"#.into()),
        Turn::Answer(answer(0.8, "code_change", &["CASE-1"], STACK_FILE)),
    ]));
    let analyzer = analyzer_with(test_config(), llm.clone(), default_sources());

    let report = BugReport::from_error("order totals disagree with ledger");
    let result = analyzer.analyze(report).await.unwrap();

    assert_eq!(
        result.category_decision,
        CategoryDecision::Model {
            category: Category::DataInvalidFormat,
            confidence: 0.7,
        }
    );
    assert_eq!(*llm.offered_tools.lock().unwrap(), vec![false, true]);
}

// ============================================================================
// Validator rules end to end
// ============================================================================

#[tokio::test]
async fn test_low_confidence_code_change_is_escalated() {
    let result = run_once(vec![Turn::Answer(answer(0.3, "code_change", &["CASE-1"], STACK_FILE))]).await;

    assert_eq!(result.fix_suggestion.fix_type, FixType::Escalate);
    assert!(result.validation.confidence_gated);
    assert_eq!(result.validation.escalation_reason, Some(EscalationReason::LowConfidence));
    assert_eq!(result.root_cause.confidence, 0.3);
}

#[tokio::test]
async fn test_unknown_case_is_flagged_and_penalized() {
    let trusted = run_once(vec![Turn::Answer(answer(0.9, "code_change", &["CASE-1"], STACK_FILE))]).await;
    let flagged = run_once(vec![Turn::Answer(answer(0.9, "code_change", &["CASE-999"], STACK_FILE))]).await;

    assert!(!trusted.validation.possible_hallucination);
    assert_eq!(trusted.root_cause.confidence, 0.9);

    assert!(flagged.validation.possible_hallucination);
    assert_eq!(flagged.validation.unverified_citations, vec!["case:CASE-999"]);
    assert!(flagged.root_cause.confidence < trusted.root_cause.confidence);
}

#[tokio::test]
async fn test_schema_violation_is_repaired_once() {
    let result = run_once(vec![
        Turn::Answer(r#"{"summary": "throttled"}"#.into()),
        Turn::Answer(answer(0.8, "config_change", &["CASE-1"], STACK_FILE)),
    ])
    .await;

    assert!(result.validation.schema_repaired);
    assert_eq!(result.fix_suggestion.fix_type, FixType::ConfigChange);
}

// ============================================================================
// Fusion through the pipeline
// ============================================================================

#[tokio::test]
async fn test_case_from_two_sources_counts_once() {
    let pattern_case = EvidenceItem::new(
        "CASE-1",
        SourceKind::Pattern,
        0.5,
        EvidencePayload::CaseMatch {
            case_id: "CASE-1".into(),
            title: "Payments quota exhausted".into(),
            root_cause: None,
            resolution: None,
            category: None,
        },
    );
    let sources = vec![
        Arc::new(StaticSource::new(SourceKind::Case, vec![case("CASE-1", 0.9)])),
        Arc::new(StaticSource::new(SourceKind::Pattern, vec![pattern_case])),
    ];
    let llm = Arc::new(ScriptedLlm::new(vec![Turn::Answer(answer(0.8, "code_change", &[], STACK_FILE))]));
    let analyzer = analyzer_with(test_config(), llm, sources);

    let result = analyzer.analyze(rate_limit_report()).await.unwrap();

    assert_eq!(result.retrieval_summary.fused_items, 1);
    assert_eq!(result.similar_cases.len(), 1);
    // case weight 0.35 vs pattern 0.15, renormalized to 0.7 / 0.3
    assert!((result.similar_cases[0].similarity - 0.7).abs() < 1e-9);
    let weights: f64 = result.retrieval_summary.sources.iter().map(|s| s.weight).sum();
    assert!((weights - 1.0).abs() < 1e-9);
}

// ============================================================================
// Feedback
// ============================================================================

#[tokio::test]
async fn test_result_is_handed_to_feedback_sink() {
    let sink = Arc::new(MemorySink::default());
    let llm = Arc::new(ScriptedLlm::new(vec![Turn::Answer(answer(
        0.8,
        "code_change",
        &["CASE-1"],
        STACK_FILE,
    ))]));
    let analyzer = Analyzer::builder(test_config())
        .llm(llm)
        .source(Arc::new(StaticSource::new(SourceKind::Case, vec![case("CASE-1", 0.9)])))
        .feedback_sink(sink.clone())
        .build();

    let result = analyzer.analyze(rate_limit_report()).await.unwrap();
    analyzer.shutdown().await;

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].analysis, result);
    assert_eq!(records[0].transcript, result.transcript);
    assert_eq!(records[0].report.bug_id, result.bug_id);
}
