// src/feedback.rs
// Fire-and-forget hand-off of finished analyses to the knowledge base

use crate::analysis::AnalysisResult;
use crate::error::Result;
use crate::reasoning::Transcript;
use crate::report::BugReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One finished analysis as stored by the knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub report: BugReport,
    pub analysis: AnalysisResult,
    pub transcript: Transcript,
}

impl FeedbackRecord {
    pub fn new(report: BugReport, analysis: AnalysisResult) -> Self {
        let transcript = analysis.transcript.clone();
        Self {
            report,
            analysis,
            transcript,
        }
    }
}

/// Where feedback records end up. Called from the recorder's worker only,
/// never on the request path.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record(&self, record: &FeedbackRecord) -> Result<()>;
}

/// Appends one JSON object per line
pub struct JsonlFeedbackSink {
    path: PathBuf,
}

impl JsonlFeedbackSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedbackSink for JsonlFeedbackSink {
    async fn record(&self, record: &FeedbackRecord) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Bounded queue in front of a [`FeedbackSink`], drained by one worker task.
pub struct FeedbackRecorder {
    tx: mpsc::Sender<FeedbackRecord>,
    worker: JoinHandle<()>,
}

impl FeedbackRecorder {
    /// Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn FeedbackSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<FeedbackRecord>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let bug_id = record.analysis.bug_id.clone();
                match sink.record(&record).await {
                    Ok(()) => debug!(bug_id = %bug_id, "Feedback recorded"),
                    Err(e) => warn!(bug_id = %bug_id, error = %e, "Failed to record feedback"),
                }
            }
            debug!("Feedback worker stopped");
        });
        Self { tx, worker }
    }

    /// Queue a record without waiting. Returns false when it was dropped.
    pub fn submit(&self, record: FeedbackRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                warn!(bug_id = %record.analysis.bug_id, "Feedback queue full, dropping record");
                false
            }
            Err(TrySendError::Closed(record)) => {
                warn!(bug_id = %record.analysis.bug_id, "Feedback worker gone, dropping record");
                false
            }
        }
    }

    /// Close the queue and wait for queued records to drain
    pub async fn shutdown(self) {
        let Self { tx, worker } = self;
        drop(tx);
        if let Err(e) = worker.await {
            warn!(error = %e, "Feedback worker panicked");
        } else {
            info!("Feedback recorder drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{EscalationReason, FixSuggestion, FixType, ImpactAssessment, RootCause, ValidationReport};
    use crate::classifier::{Category, CategoryDecision};
    use crate::fusion::RetrievalSummary;
    use crate::report::Severity;
    use std::sync::Mutex;
    use std::time::Duration;

    fn record(bug_id: &str) -> FeedbackRecord {
        let analysis = AnalysisResult {
            analysis_id: "an-1".into(),
            bug_id: bug_id.into(),
            summary: "escalated".into(),
            root_cause: RootCause {
                description: "unknown".into(),
                category: Category::Unknown,
                confidence: 0.1,
            },
            location: None,
            fix_suggestion: FixSuggestion {
                fix_type: FixType::Escalate,
                description: "escalate".into(),
                code_diff: None,
                test_verification: String::new(),
            },
            impact_assessment: ImpactAssessment {
                affected_users: "unknown".into(),
                affected_features: vec![],
                urgency: Severity::P2,
            },
            similar_cases: vec![],
            additional_investigation: vec![],
            category_decision: CategoryDecision::Model {
                category: Category::Unknown,
                confidence: 0.0,
            },
            validation: ValidationReport {
                escalation_reason: Some(EscalationReason::ModelDisabled),
                ..Default::default()
            },
            retrieval_summary: RetrievalSummary::default(),
            transcript: Transcript::new(),
        };
        FeedbackRecord::new(BugReport::from_error("boom"), analysis)
    }

    /// Blocks every write until released
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FeedbackSink for GatedSink {
        async fn record(&self, record: &FeedbackRecord) -> Result<()> {
            let _permit = self.gate.acquire().await.unwrap();
            self.seen.lock().unwrap().push(record.analysis.bug_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlFeedbackSink::new(dir.path().join("nested").join("feedback.jsonl"));
        sink.record(&record("BUG-1")).await.unwrap();
        sink.record(&record("BUG-2")).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: FeedbackRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.analysis.bug_id, "BUG-2");
        assert_eq!(parsed.report.error_info.error_message, "boom");
    }

    #[tokio::test]
    async fn test_recorder_drains_on_shutdown() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(100),
            seen: Mutex::new(Vec::new()),
        });
        let recorder = FeedbackRecorder::spawn(sink.clone(), 8);
        assert!(recorder.submit(record("BUG-1")));
        assert!(recorder.submit(record("BUG-2")));
        recorder.shutdown().await;
        assert_eq!(*sink.seen.lock().unwrap(), vec!["BUG-1", "BUG-2"]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let recorder = FeedbackRecorder::spawn(sink.clone(), 1);
        // first record is taken by the worker and parks on the gate
        assert!(recorder.submit(record("BUG-1")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.submit(record("BUG-2")));
        assert!(!recorder.submit(record("BUG-3")));

        sink.gate.add_permits(10);
        recorder.shutdown().await;
        assert_eq!(*sink.seen.lock().unwrap(), vec!["BUG-1", "BUG-2"]);
    }
}
