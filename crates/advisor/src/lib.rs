//! LLM-backed code advisor.
//!
//! The advisor only proposes codes. Whether a suggestion survives is decided
//! by the hybrid merge in `ipcoder-core`, which checks every advisor-only code
//! against the knowledge base and the note text.
//!
//! - `llm`: provider clients behind the `LlmClient` trait
//! - `advisor`: prompt construction and reply parsing
//! - `guardrails`: structural checks on parsed suggestions

pub mod advisor;
pub mod guardrails;
pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipcoder_core::advisor::CodeAdvisor;
use ipcoder_core::config::{AdvisorConfig, LlmProvider};
use ipcoder_core::knowledge::KnowledgeBase;
use tracing::{info, warn};

use crate::advisor::LlmCodeAdvisor;
use crate::guardrails::AdvisorGuardrails;
use crate::llm::{AnthropicClient, OllamaClient, OpenAiCompatibleClient};

/// `None` when the advisor is disabled or its provider lacks credentials;
/// the orchestrator then codes with rules only.
pub fn advisor_from_config(
    config: &AdvisorConfig,
    knowledge: &KnowledgeBase,
) -> Result<Option<Arc<dyn CodeAdvisor>>> {
    if !config.enabled {
        return Ok(None);
    }
    if !config.has_credentials() {
        warn!(
            event_name = "advisor.credentials_missing",
            provider = config.provider.as_str(),
            "advisor enabled without credentials; coding will run rules only"
        );
        return Ok(None);
    }

    let timeout = Duration::from_secs(config.timeout_secs);
    let guardrails = AdvisorGuardrails::new(config.max_suggestions);
    let name = format!("{}:{}", config.provider.as_str(), config.model);
    let advisor: Arc<dyn CodeAdvisor> = match config.provider {
        LlmProvider::OpenAi => Arc::new(LlmCodeAdvisor::new(
            OpenAiCompatibleClient::new(
                config.base_url.clone(),
                &config.model,
                config.api_key.clone(),
                timeout,
            )?,
            name.clone(),
            knowledge,
            guardrails,
        )?),
        LlmProvider::Anthropic => {
            let api_key = config.api_key.clone().context("anthropic advisor requires an api key")?;
            Arc::new(LlmCodeAdvisor::new(
                AnthropicClient::new(config.base_url.clone(), &config.model, api_key, timeout)?,
                name.clone(),
                knowledge,
                guardrails,
            )?)
        }
        LlmProvider::Ollama => Arc::new(LlmCodeAdvisor::new(
            OllamaClient::new(config.base_url.clone(), &config.model, timeout)?,
            name.clone(),
            knowledge,
            guardrails,
        )?),
    };

    info!(event_name = "advisor.configured", advisor = %name, "code advisor ready");
    Ok(Some(advisor))
}

#[cfg(test)]
mod tests {
    use ipcoder_core::config::{CoderConfig, LlmProvider};
    use ipcoder_core::knowledge::KnowledgeBase;

    use super::advisor_from_config;

    #[test]
    fn disabled_or_keyless_advisor_is_not_built() {
        let knowledge = KnowledgeBase::builtin().expect("builtin knowledge");
        let mut config = CoderConfig::default().advisor;
        assert!(advisor_from_config(&config, &knowledge).expect("config").is_none());

        config.enabled = true;
        config.provider = LlmProvider::OpenAi;
        config.api_key = None;
        assert!(advisor_from_config(&config, &knowledge).expect("config").is_none());
    }

    #[test]
    fn local_provider_needs_only_a_base_url() {
        let knowledge = KnowledgeBase::builtin().expect("builtin knowledge");
        let mut config = CoderConfig::default().advisor;
        config.enabled = true;

        let advisor = advisor_from_config(&config, &knowledge).expect("config").expect("advisor");
        assert_eq!(advisor.name(), "ollama:llama3.1");
    }
}
