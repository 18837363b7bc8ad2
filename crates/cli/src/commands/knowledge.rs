use std::path::PathBuf;

use ipcoder_core::config::ConfigOverrides;
use ipcoder_core::knowledge::store::KnowledgeStore;

use crate::commands::{config_failure, CommandResult, GlobalOptions, EXIT_KNOWLEDGE};

pub fn run(global: &GlobalOptions, path: Option<PathBuf>) -> CommandResult {
    let config = match global
        .load_config(ConfigOverrides { knowledge_path: path, ..ConfigOverrides::default() })
    {
        Ok(config) => config,
        Err(error) => return config_failure("knowledge", error),
    };

    let source = config.knowledge.source();
    match KnowledgeStore::open(source.clone()) {
        Ok(store) => {
            let summary = store.snapshot().summary();
            CommandResult::success_with_data(
                "knowledge",
                format!("knowledge base from {} is valid", source.label()),
                summary,
            )
        }
        Err(error) => CommandResult::failure(
            "knowledge",
            "knowledge_validation",
            format!("knowledge base from {} is invalid: {error}", source.label()),
            EXIT_KNOWLEDGE,
        ),
    }
}
