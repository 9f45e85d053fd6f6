//! Model routing and the text-generation capability.

pub mod openrouter;

use async_trait::async_trait;

pub use openrouter::OpenRouterClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Suggestion,
    Summary,
    Report,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Suggestion => "suggestion",
            TaskKind::Summary => "summary",
            TaskKind::Report => "report",
        }
    }
}

/// Generation parameters resolved for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelProfile {
    pub primary_model: String,
    pub fallback_model: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

/// Model ids are configuration, never hardcoded at call sites.
#[derive(Debug, Clone, Default)]
pub struct ModelRouterConfig {
    pub suggestion_primary: String,
    pub suggestion_fallback: String,
    pub summary_primary: String,
    pub summary_fallback: String,
    pub report_primary: String,
    pub report_fallback: String,
}

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct ModelRouter {
    config: ModelRouterConfig,
}

impl ModelRouter {
    pub fn new(mut config: ModelRouterConfig) -> Self {
        for slot in [
            &mut config.suggestion_primary,
            &mut config.suggestion_fallback,
            &mut config.summary_primary,
            &mut config.summary_fallback,
            &mut config.report_primary,
            &mut config.report_fallback,
        ] {
            if slot.trim().is_empty() {
                *slot = DEFAULT_MODEL.to_string();
            }
        }
        Self { config }
    }

    /// Pure task -> profile mapping. Unrecognized tasks resolve to the
    /// summary profile.
    pub fn select(&self, task: TaskKind) -> ModelProfile {
        match task {
            TaskKind::Suggestion => ModelProfile {
                primary_model: self.config.suggestion_primary.clone(),
                fallback_model: self.config.suggestion_fallback.clone(),
                temperature: 0.4,
                max_output_tokens: 500,
            },
            TaskKind::Summary => ModelProfile {
                primary_model: self.config.summary_primary.clone(),
                fallback_model: self.config.summary_fallback.clone(),
                temperature: 0.2,
                max_output_tokens: 700,
            },
            TaskKind::Report => ModelProfile {
                primary_model: self.config.report_primary.clone(),
                fallback_model: self.config.report_fallback.clone(),
                temperature: 0.2,
                max_output_tokens: 1400,
            },
        }
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new(ModelRouterConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub instructions: String,
    pub input: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateResult {
    pub text: String,
    pub model_id: String,
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("text generator unavailable")]
    Unavailable,

    #[error("model is required")]
    MissingModel,

    #[error("input is required")]
    MissingInput,

    #[error("provider status {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("provider timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("primary model failed: {primary}; fallback failed: {fallback}")]
    Ladder { primary: String, fallback: String },
}

impl GeneratorError {
    /// Transient faults worth another attempt: rate limiting, provider 5xx,
    /// timeouts and "temporary" transport messages.
    pub fn is_retryable(&self) -> bool {
        match self {
            GeneratorError::Provider { status, .. } => *status == 429 || *status >= 500,
            GeneratorError::Timeout => true,
            GeneratorError::Transport(message) => {
                let lowered = message.to_lowercase();
                lowered.contains("timeout") || lowered.contains("tempor")
            }
            _ => false,
        }
    }
}

/// Single call to a generative model. Polymorphic over provider; an
/// unavailable generator fails with [`GeneratorError::Unavailable`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResult, GeneratorError>;
    fn available(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_defaults_every_empty_slot() {
        let router = ModelRouter::new(ModelRouterConfig {
            report_primary: "anthropic/claude-sonnet".to_string(),
            ..ModelRouterConfig::default()
        });

        let report = router.select(TaskKind::Report);
        assert_eq!(report.primary_model, "anthropic/claude-sonnet");
        assert_eq!(report.fallback_model, DEFAULT_MODEL);

        let suggestion = router.select(TaskKind::Suggestion);
        assert_eq!(suggestion.primary_model, DEFAULT_MODEL);
    }

    #[test]
    fn profiles_follow_task_shape() {
        let router = ModelRouter::default();
        let suggestion = router.select(TaskKind::Suggestion);
        let summary = router.select(TaskKind::Summary);
        let report = router.select(TaskKind::Report);

        assert!(suggestion.temperature > summary.temperature);
        assert!(report.max_output_tokens > summary.max_output_tokens);
        assert!(summary.max_output_tokens > suggestion.max_output_tokens);
    }

    #[test]
    fn retryability_covers_transient_faults() {
        assert!(GeneratorError::Provider { status: 429, message: String::new() }.is_retryable());
        assert!(GeneratorError::Provider { status: 503, message: String::new() }.is_retryable());
        assert!(!GeneratorError::Provider { status: 400, message: String::new() }.is_retryable());
        assert!(GeneratorError::Timeout.is_retryable());
        assert!(GeneratorError::Transport("connection temporarily refused".into()).is_retryable());
        assert!(!GeneratorError::Unavailable.is_retryable());
    }
}
