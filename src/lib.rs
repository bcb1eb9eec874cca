// src/lib.rs
// debug-agent - incident triage engine for backend services

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod analysis;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod evidence;
pub mod feedback;
pub mod fusion;
pub mod llm;
pub mod pipeline;
pub mod preprocess;
pub mod reasoning;
pub mod report;
pub mod retry;
pub mod server;
pub mod tools;
pub mod validator;

pub use analysis::AnalysisResult;
pub use error::{Result, TriageError};
pub use pipeline::Analyzer;
pub use report::BugReport;
