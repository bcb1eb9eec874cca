// src/server.rs
// HTTP API over the analyzer

use crate::analysis::{AnalysisResult, FixType};
use crate::classifier::Category;
use crate::error::TriageError;
use crate::pipeline::Analyzer;
use crate::report::BugReport;
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Analyses listed when `limit` is not given
const DEFAULT_LIST_LIMIT: usize = 20;

/// Error body: `{"error": {"code", "message"}}`
#[derive(Debug)]
pub struct ApiError {
    pub status_code: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::UNPROCESSABLE_ENTITY,
            code: "INVALID_REPORT",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!(status = %self.status_code, message = %self.message, "API error");
        }
        let body = json!({"error": {"code": self.code, "message": self.message}});
        (self.status_code, Json(body)).into_response()
    }
}

impl From<TriageError> for ApiError {
    fn from(err: TriageError) -> Self {
        if err.is_client_error() {
            Self::unprocessable(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status_code: rejection.status(),
            code: "INVALID_REPORT",
            message: rejection.body_text(),
        }
    }
}

/// Most recent analyses, oldest evicted first
#[derive(Debug)]
pub struct History {
    capacity: usize,
    entries: VecDeque<AnalysisResult>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, result: AnalysisResult) {
        // a rerun of the same report replaces the older entry
        self.entries.retain(|r| r.analysis_id != result.analysis_id);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    /// Look up by analysis id or bug id
    pub fn get(&self, id: &str) -> Option<&AnalysisResult> {
        self.entries
            .iter()
            .rev()
            .find(|r| r.analysis_id == id || r.bug_id == id)
    }

    /// Newest first
    pub fn latest(&self, limit: usize) -> impl Iterator<Item = &AnalysisResult> {
        self.entries.iter().rev().take(limit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<Analyzer>,
    pub history: Arc<RwLock<History>>,
}

impl AppState {
    pub fn new(analyzer: Arc<Analyzer>, history_capacity: usize) -> Self {
        Self {
            analyzer,
            history: Arc::new(RwLock::new(History::new(history_capacity))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// One row of `GET /api/v1/analyses`
#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub analysis_id: String,
    pub bug_id: String,
    pub summary: String,
    pub category: Category,
    pub fix_type: FixType,
    pub confidence: f64,
}

impl From<&AnalysisResult> for AnalysisSummary {
    fn from(r: &AnalysisResult) -> Self {
        Self {
            analysis_id: r.analysis_id.clone(),
            bug_id: r.bug_id.clone(),
            summary: r.summary.clone(),
            category: r.root_cause.category,
            fix_type: r.fix_suggestion.fix_type,
            confidence: r.root_cause.confidence,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/analyze", post(analyze_handler))
        .route("/api/v1/analysis/{id}", get(get_analysis_handler))
        .route("/api/v1/analyses", get(list_analyses_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let info = state.analyzer.info();
    let stored = state.history.read().await.len();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model": info.model,
        "sources": info.sources,
        "trace_backend": info.trace_backend,
        "feedback": info.feedback,
        "open_circuits": info.open_circuits,
        "stored_analyses": stored,
    }))
}

async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<BugReport>, JsonRejection>,
) -> Result<Json<AnalysisResult>, ApiError> {
    let Json(report) = payload?;
    let result = state.analyzer.analyze(report).await?;
    state.history.write().await.push(result.clone());
    Ok(Json(result))
}

async fn get_analysis_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisResult>, ApiError> {
    let history = state.history.read().await;
    history
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no analysis with id '{}'", id)))
}

async fn list_analyses_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<AnalysisSummary>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let history = state.history.read().await;
    Json(history.latest(limit).map(AnalysisSummary::from).collect())
}

/// Serve until ctrl-c
pub async fn run(state: AppState, addr: SocketAddr) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
