use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdvisorSuggestion {
    pub code: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

impl AdvisorSuggestion {
    pub fn new(code: impl Into<String>, confidence: f64, rationale: impl Into<String>) -> Self {
        Self { code: code.into(), confidence, rationale: rationale.into() }
    }
}

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor transport failed: {0}")]
    Transport(String),
    #[error("advisor returned malformed output: {0}")]
    MalformedOutput(String),
    #[error("advisor is not configured: {0}")]
    NotConfigured(String),
}

/// Anything that proposes codes for a note. Suggestions are advisory only;
/// the hybrid policy decides what survives.
#[async_trait]
pub trait CodeAdvisor: Send + Sync {
    fn name(&self) -> &str;

    async fn suggest_codes(&self, text: &str) -> Result<Vec<AdvisorSuggestion>, AdvisorError>;
}
