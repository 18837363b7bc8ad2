use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use ipcoder_advisor::advisor_from_config;
use ipcoder_core::config::ConfigOverrides;
use ipcoder_core::domain::evidence::EvidenceInput;
use ipcoder_core::hybrid::MergePolicy;
use ipcoder_core::knowledge::store::KnowledgeStore;
use ipcoder_core::orchestrator::{CodingEvidence, CodingOrchestrator, CodingRequest};

use crate::commands::{
    config_failure, CommandResult, GlobalOptions, EXIT_CODING, EXIT_INPUT, EXIT_KNOWLEDGE,
    EXIT_RUNTIME,
};

#[derive(Debug, Clone)]
pub struct CodeOptions {
    pub input: PathBuf,
    pub policy: Option<MergePolicy>,
    pub knowledge_path: Option<PathBuf>,
}

pub fn run(global: &GlobalOptions, options: CodeOptions) -> CommandResult {
    let config = match global.load_config(ConfigOverrides {
        knowledge_path: options.knowledge_path.clone(),
        ..ConfigOverrides::default()
    }) {
        Ok(config) => config,
        Err(error) => return config_failure("code", error),
    };

    let mut request = match read_request(&options.input) {
        Ok(request) => request,
        Err(message) => return CommandResult::failure("code", "invalid_input", message, EXIT_INPUT),
    };
    if let Some(policy) = options.policy {
        request.policy = Some(policy.as_str().to_string());
    }

    let knowledge = match KnowledgeStore::open(config.knowledge.source()) {
        Ok(store) => Arc::new(store),
        Err(error) => {
            return CommandResult::failure(
                "code",
                "knowledge_validation",
                error.to_string(),
                EXIT_KNOWLEDGE,
            )
        }
    };
    let advisor = match advisor_from_config(&config.advisor, &knowledge.snapshot()) {
        Ok(advisor) => advisor,
        Err(error) => {
            return CommandResult::failure(
                "code",
                "advisor_init",
                format!("{error:#}"),
                EXIT_RUNTIME,
            )
        }
    };
    let orchestrator = match CodingOrchestrator::from_config(&config, knowledge, advisor) {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            return CommandResult::failure("code", "rules_init", error.to_string(), EXIT_KNOWLEDGE)
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "code",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME,
            );
        }
    };

    let correlation_id = request
        .correlation_id
        .clone()
        .or_else(|| request.evidence.note_id().map(str::to_string))
        .unwrap_or_else(|| "cli".to_string());
    match runtime.block_on(orchestrator.code(request)) {
        Ok(report) => {
            let message = format!(
                "coded {} with {} code(s) under {}",
                report.note_id.as_deref().unwrap_or("note"),
                report.codes.len(),
                report.policy_applied
            );
            CommandResult::success_with_data("code", message, report)
        }
        Err(error) => {
            let interface = error.into_interface(correlation_id);
            CommandResult::failure(
                "code",
                interface.error_class(),
                format!("{} ({interface})", interface.user_message()),
                EXIT_CODING,
            )
        }
    }
}

/// Accepts a full coding request or a bare evidence context.
fn read_request(path: &PathBuf) -> Result<CodingRequest, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("could not read input `{}`: {error}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|error| format!("input `{}` is not valid JSON: {error}", path.display()))?;

    if value.get("evidence").is_some() {
        return serde_json::from_value(value).map_err(|error| {
            format!("input `{}` is not a coding request: {error}", path.display())
        });
    }
    let evidence: EvidenceInput = serde_json::from_value(value).map_err(|error| {
        format!("input `{}` is not an evidence context: {error}", path.display())
    })?;
    Ok(CodingRequest::new(CodingEvidence::Context(evidence)))
}
