// src/config/mod.rs
// Configuration: TOML file plus environment overrides

pub mod env;
pub mod file;

pub use env::{ConfigValidation, EnvOverrides};
pub use file::{
    AppConfig, BreakerConfig, ClassifierConfig, FeedbackConfig, FusionConfig, LlmConfig, PipelineConfig,
    ReasoningConfig, ServerConfig, SourceConfig, SourcesConfig, TraceBackendConfig, ValidatorConfig,
};
