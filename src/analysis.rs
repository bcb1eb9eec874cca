// src/analysis.rs
// Structured analysis result returned for every accepted report

use crate::classifier::{Category, CategoryDecision};
use crate::error::TriageError;
use crate::fusion::RetrievalSummary;
use crate::reasoning::Transcript;
use crate::report::Severity;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FixType {
    CodeChange,
    ConfigChange,
    Rollback,
    #[serde(alias = "no_action")]
    #[strum(to_string = "escalate", serialize = "no_action")]
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub description: String,
    pub category: Category,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file: String,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub function: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSuggestion {
    #[serde(rename = "type", alias = "fix_type")]
    pub fix_type: FixType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_diff: Option<String>,
    #[serde(default)]
    pub test_verification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub affected_users: String,
    pub affected_features: Vec<String>,
    pub urgency: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarCase {
    pub case_id: String,
    pub similarity: f64,
    pub resolution: String,
}

/// Why an analysis was handed to a human instead of acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EscalationReason {
    /// Tool-call rounds exhausted without a final answer
    IterationBudget,
    ModelUnavailable,
    MalformedOutput,
    SchemaViolation,
    Deadline,
    LowConfidence,
    ModelDisabled,
}

impl EscalationReason {
    /// The failure behind the escalation. Low confidence and a disabled
    /// model are decisions, not failures.
    pub fn cause(self) -> Option<TriageError> {
        match self {
            Self::IterationBudget => Some(TriageError::BudgetExceeded("tool-call rounds exhausted".into())),
            Self::Deadline => Some(TriageError::BudgetExceeded("analysis deadline reached".into())),
            Self::ModelUnavailable => Some(TriageError::ModelCall("model unreachable after one retry".into())),
            Self::MalformedOutput | Self::SchemaViolation => Some(TriageError::SchemaViolation(
                "model answer could not be repaired".into(),
            )),
            Self::LowConfidence | Self::ModelDisabled => None,
        }
    }
}

/// What the validator did to the model's answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub schema_repaired: bool,
    pub confidence_gated: bool,
    pub possible_hallucination: bool,
    pub unverified_citations: Vec<String>,
    pub escalation_reason: Option<EscalationReason>,
}

/// The sole authoritative output for one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_id: String,
    pub bug_id: String,
    pub summary: String,
    pub root_cause: RootCause,
    pub location: Option<CodeLocation>,
    pub fix_suggestion: FixSuggestion,
    pub impact_assessment: ImpactAssessment,
    pub similar_cases: Vec<SimilarCase>,
    pub additional_investigation: Vec<String>,
    pub category_decision: CategoryDecision,
    pub validation: ValidationReport,
    pub retrieval_summary: RetrievalSummary,
    pub transcript: Transcript,
}

impl AnalysisResult {
    pub fn is_escalation(&self) -> bool {
        self.fix_suggestion.fix_type == FixType::Escalate
    }

    /// Plain-text rendering for terminals
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Bug:         {}\n", self.bug_id));
        out.push_str(&format!("Analysis:    {}\n", self.analysis_id));
        out.push_str(&format!("Summary:     {}\n", self.summary));
        out.push_str(&format!(
            "Root cause:  {} [{}] (confidence {:.2})\n",
            self.root_cause.description, self.root_cause.category, self.root_cause.confidence
        ));
        if let Some(loc) = &self.location {
            let mut line = loc.file.clone();
            if let Some(start) = loc.line_start {
                line.push_str(&format!(":{}", start));
                if let Some(end) = loc.line_end.filter(|e| *e != start) {
                    line.push_str(&format!("-{}", end));
                }
            }
            if let Some(func) = &loc.function {
                line.push_str(&format!(" in {}", func));
            }
            out.push_str(&format!("Location:    {}\n", line));
        }
        out.push_str(&format!(
            "Fix:         {}: {}\n",
            self.fix_suggestion.fix_type, self.fix_suggestion.description
        ));
        out.push_str(&format!("Urgency:     {}\n", self.impact_assessment.urgency));
        if let Some(reason) = self.validation.escalation_reason {
            out.push_str(&format!("Escalated:   {}\n", reason));
        }
        if self.validation.possible_hallucination {
            out.push_str(&format!(
                "Warning:     unverified citations: {}\n",
                self.validation.unverified_citations.join(", ")
            ));
        }
        for case in &self.similar_cases {
            out.push_str(&format!(
                "Similar:     {} ({:.2}) {}\n",
                case.case_id, case.similarity, case.resolution
            ));
        }
        for step in &self.additional_investigation {
            out.push_str(&format!("Next:        {}\n", step));
        }
        out
    }
}
