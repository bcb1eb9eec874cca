// src/evidence/http.rs
// Evidence source backed by a JSON search endpoint

use super::{
    EvidenceItem, EvidencePayload, EvidenceQuery, EvidenceSource, SourceError, SourceKind, SourceLimits,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// Wire shape of one search hit
#[derive(Debug, Deserialize)]
struct WireItem {
    id: String,
    score: f64,
    #[serde(default)]
    recency: Option<DateTime<Utc>>,
    payload: EvidencePayload,
}

/// Endpoints may answer with `{"items": [...]}` or a bare array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Wrapped { items: Vec<WireItem> },
    Bare(Vec<WireItem>),
}

impl WireResponse {
    fn into_items(self) -> Vec<WireItem> {
        match self {
            Self::Wrapped { items } | Self::Bare(items) => items,
        }
    }
}

/// POSTs the query context to a search endpoint (case store, code index,
/// pattern library or config store) and decodes ranked items.
pub struct HttpEvidenceSource {
    kind: SourceKind,
    endpoint: Url,
    limits: SourceLimits,
    api_key: Option<String>,
    client: Client,
}

impl HttpEvidenceSource {
    pub fn new(kind: SourceKind, endpoint: Url, limits: SourceLimits, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(limits.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            kind,
            endpoint,
            limits,
            api_key,
            client,
        }
    }

    /// Tag, clamp and rank decoded hits
    fn finish(&self, wire: Vec<WireItem>) -> Vec<EvidenceItem> {
        let mut items: Vec<EvidenceItem> = wire
            .into_iter()
            .filter(|w| w.score.is_finite())
            .map(|w| {
                let mut item = EvidenceItem::new(w.id, self.kind, w.score, w.payload);
                item.recency = w.recency;
                item
            })
            .collect();
        items.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(self.limits.max_items);
        items
    }
}

#[async_trait]
impl EvidenceSource for HttpEvidenceSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn limits(&self) -> SourceLimits {
        self.limits
    }

    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceItem>, SourceError> {
        let mut body = query.clone();
        body.limit = self.limits.max_items;

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let decoded: WireResponse =
            serde_json::from_str(&text).map_err(|e| SourceError::Decode(e.to_string()))?;

        let items = self.finish(decoded.into_items());
        debug!(source = %self.kind, count = items.len(), "Evidence source answered");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source(max_items: usize) -> HttpEvidenceSource {
        HttpEvidenceSource::new(
            SourceKind::Case,
            Url::parse("http://127.0.0.1:9/search").unwrap(),
            SourceLimits {
                timeout: Duration::from_millis(200),
                max_items,
            },
            None,
        )
    }

    #[test]
    fn test_decodes_wrapped_and_bare_responses() {
        let wrapped = r#"{"items": [{"id": "c1", "score": 0.9, "payload": {"type": "case_match", "case_id": "CASE-1"}}]}"#;
        let bare = r#"[{"id": "c1", "score": 0.9, "payload": {"type": "case_match", "case_id": "CASE-1"}}]"#;
        let a: WireResponse = serde_json::from_str(wrapped).unwrap();
        let b: WireResponse = serde_json::from_str(bare).unwrap();
        assert_eq!(a.into_items().len(), 1);
        assert_eq!(b.into_items().len(), 1);
    }

    #[test]
    fn test_finish_tags_sorts_and_truncates() {
        let json = r#"[
            {"id": "a", "score": 0.2, "payload": {"type": "case_match", "case_id": "A"}},
            {"id": "b", "score": 1.7, "payload": {"type": "case_match", "case_id": "B"}},
            {"id": "c", "score": 0.5, "payload": {"type": "case_match", "case_id": "C"}}
        ]"#;
        let wire: WireResponse = serde_json::from_str(json).unwrap();
        let items = source(2).finish(wire.into_items());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "b");
        assert_eq!(items[0].raw_score, 1.0);
        assert_eq!(items[1].id, "c");
        assert!(items.iter().all(|i| i.source == SourceKind::Case));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let query = EvidenceQuery {
            bug_id: "BUG-1".into(),
            text: "boom".into(),
            category: crate::classifier::Category::Unknown,
            exception_type: None,
            error_code: None,
            service: "svc".into(),
            trace_id: None,
            keywords: vec![],
            files: vec![],
            limit: 5,
        };
        let err = source(5).query(&query).await.unwrap_err();
        assert!(matches!(err, SourceError::Transport(_)));
    }
}
