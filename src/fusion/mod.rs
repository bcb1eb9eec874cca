// src/fusion/mod.rs
// Parallel evidence retrieval with weighted, deduplicated blending

pub mod weights;

pub use weights::{WeightTable, normalize_within_source};

use crate::circuit_breaker::{CircuitBreaker, Dependency};
use crate::classifier::Category;
use crate::error::TriageError;
use crate::evidence::{
    EvidenceItem, EvidencePayload, EvidenceQuery, EvidenceSource, SourceKind, SourceOutcome,
};
use crate::preprocess::PreparedReport;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An evidence item with its blended score attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedItem {
    /// Blended score in [0,1]
    pub score: f64,
    #[serde(flatten)]
    pub item: EvidenceItem,
}

/// Ranked evidence handed to the reasoning loop.
///
/// Sorted by score descending, then recency descending, then source
/// priority ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedContext {
    pub items: Vec<FusedItem>,
}

impl FusedContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FusedItem> {
        self.items.iter()
    }

    /// Case ids present in the context
    pub fn case_ids(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .filter_map(|f| match &f.item.payload {
                EvidencePayload::CaseMatch { case_id, .. } => Some(case_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Files named by code matches
    pub fn code_files(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .filter_map(|f| match &f.item.payload {
                EvidencePayload::CodeMatch { file, .. } => Some(file.clone()),
                _ => None,
            })
            .collect()
    }

    /// Case matches in rank order
    pub fn cases(&self) -> impl Iterator<Item = &FusedItem> {
        self.items
            .iter()
            .filter(|f| matches!(f.item.payload, EvidencePayload::CaseMatch { .. }))
    }
}

/// What one source contributed to a fusion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceKind,
    pub outcome: SourceOutcome,
    /// Renormalized weight; zero for excluded sources
    pub weight: f64,
    /// Wall-clock only; kept out of the serialized result so reruns match
    #[serde(skip)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub sources: Vec<SourceReport>,
    pub fused_items: usize,
}

/// Build the query every source receives
pub fn build_query(report: &PreparedReport, category: Category, limit: usize) -> EvidenceQuery {
    let r = &report.report;
    EvidenceQuery {
        bug_id: r.bug_id.clone(),
        text: report.search_query.clone(),
        category,
        exception_type: report.stack.exception_type.clone(),
        error_code: r.error_info.error_code.clone(),
        service: r.environment.service.clone(),
        trace_id: r.trace_id().map(str::to_string),
        keywords: report.keywords.clone(),
        files: report.stack_files(),
        limit,
    }
}

/// Fans one query out to every source and blends what comes back.
pub struct FusionEngine {
    sources: Vec<Arc<dyn EvidenceSource>>,
    weights: WeightTable,
    breaker: CircuitBreaker,
}

impl FusionEngine {
    pub fn new(sources: Vec<Arc<dyn EvidenceSource>>, weights: WeightTable, breaker: CircuitBreaker) -> Self {
        Self {
            sources,
            weights,
            breaker,
        }
    }

    pub fn source_kinds(&self) -> Vec<SourceKind> {
        self.sources.iter().map(|s| s.kind()).collect()
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// Query all sources concurrently and return the fused context.
    ///
    /// Never fails. A source that times out, errors, answers empty, or has an
    /// open circuit is left out and the remaining weights are renormalized.
    pub async fn fuse(
        &self,
        report: &PreparedReport,
        category: Category,
        cancel: &CancellationToken,
    ) -> (FusedContext, RetrievalSummary) {
        let start = Instant::now();
        let bug_id = report.report.bug_id.as_str();

        let tasks = self.sources.iter().map(|source| {
            let query = build_query(report, category, source.limits().max_items);
            self.query_source(Arc::clone(source), query, cancel)
        });
        let results = join_all(tasks).await;

        let succeeded: Vec<SourceKind> = results
            .iter()
            .filter(|(_, outcome, items, _)| outcome.succeeded() && !items.is_empty())
            .map(|(kind, ..)| *kind)
            .collect();
        let weights = self.weights.renormalize(&succeeded);

        let mut merged: BTreeMap<String, FusedItem> = BTreeMap::new();
        let mut sources = Vec::with_capacity(results.len());
        for (kind, outcome, items, elapsed_ms) in results {
            let weight = if outcome.succeeded() {
                weights.get(&kind).copied().unwrap_or(0.0)
            } else {
                0.0
            };
            sources.push(SourceReport {
                source: kind,
                outcome,
                weight,
                elapsed_ms,
            });
            if !weights.contains_key(&kind) {
                continue;
            }

            let raw: Vec<f64> = items.iter().map(|i| i.raw_score).collect();
            for (item, normalized) in items.into_iter().zip(normalize_within_source(&raw)) {
                let candidate = FusedItem {
                    score: (weight * normalized).clamp(0.0, 1.0),
                    item,
                };
                merge(&mut merged, candidate);
            }
        }

        let mut items: Vec<FusedItem> = merged.into_values().collect();
        items.sort_by(rank);

        let summary = RetrievalSummary {
            fused_items: items.len(),
            sources,
        };
        info!(
            bug_id,
            sources = summary.sources.len(),
            succeeded = succeeded.len(),
            fused_items = summary.fused_items,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Evidence fusion complete"
        );
        (FusedContext { items }, summary)
    }

    async fn query_source(
        &self,
        source: Arc<dyn EvidenceSource>,
        query: EvidenceQuery,
        cancel: &CancellationToken,
    ) -> (SourceKind, SourceOutcome, Vec<EvidenceItem>, u64) {
        let kind = source.kind();
        let limits = source.limits();
        let dep = Dependency::Source(kind);
        let start = Instant::now();

        if !self.breaker.is_available(dep) {
            debug!(source = %kind, "Circuit open, skipping source");
            let reason = "circuit open".to_string();
            return (kind, SourceOutcome::Skipped { reason }, Vec::new(), 0);
        }

        let call = tokio::time::timeout(limits.timeout, source.query(&query));
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            r = call => Some(r),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (outcome, items) = match result {
            None => {
                let reason = "cancelled".to_string();
                (SourceOutcome::Skipped { reason }, Vec::new())
            }
            Some(Err(_)) => {
                self.breaker.record_failure(dep);
                let after_ms = limits.timeout.as_millis() as u64;
                let err = TriageError::SourceTimeout {
                    kind: kind.to_string(),
                    timeout_ms: after_ms,
                };
                warn!(source = %kind, error = %err, "Evidence source degraded");
                (SourceOutcome::TimedOut { after_ms }, Vec::new())
            }
            Some(Ok(Err(e))) => {
                self.breaker.record_failure(dep);
                let reason = e.to_string();
                let err = TriageError::SourceUnavailable {
                    kind: kind.to_string(),
                    reason: reason.clone(),
                };
                warn!(source = %kind, error = %err, "Evidence source degraded");
                (SourceOutcome::Failed { reason }, Vec::new())
            }
            Some(Ok(Ok(mut items))) => {
                self.breaker.record_success(dep);
                for item in items.iter_mut() {
                    item.source = kind;
                }
                items.truncate(limits.max_items);
                if items.is_empty() {
                    debug!(source = %kind, elapsed_ms, "Evidence source returned nothing");
                    (SourceOutcome::Empty, items)
                } else {
                    debug!(source = %kind, count = items.len(), elapsed_ms, "Evidence source answered");
                    (SourceOutcome::Items { count: items.len() }, items)
                }
            }
        };
        (kind, outcome, items, elapsed_ms)
    }
}

/// Keep the larger weighted contribution for an entity seen twice
fn merge(merged: &mut BTreeMap<String, FusedItem>, candidate: FusedItem) {
    let key = candidate.item.payload.entity_key();
    match merged.get_mut(&key) {
        None => {
            merged.insert(key, candidate);
        }
        Some(existing) => {
            let recency = latest(existing.item.recency, candidate.item.recency);
            let replace = match candidate.score.total_cmp(&existing.score) {
                Ordering::Greater => true,
                Ordering::Equal => candidate.item.source.priority() < existing.item.source.priority(),
                Ordering::Less => false,
            };
            if replace {
                *existing = candidate;
            }
            existing.item.recency = recency;
        }
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn rank(a: &FusedItem, b: &FusedItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.item.recency.cmp(&a.item.recency))
        .then_with(|| a.item.source.priority().cmp(&b.item.source.priority()))
        .then_with(|| a.item.id.cmp(&b.item.id))
}
