use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ipcoder_core::config::{ConfigOverrides, ConfigView};
use serde::Serialize;
use toml::Value;

use crate::commands::{config_failure, CommandResult, GlobalOptions};

/// Config key, the environment variables that can set it (first wins).
const FIELDS: [(&str, &[&str]); 16] = [
    ("hybrid.policy", &["IPCODER_HYBRID_POLICY"]),
    ("hybrid.advisor_confidence_auto_accept", &["IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT"]),
    ("hybrid.rule_confidence_low_threshold", &["IPCODER_HYBRID_RULE_CONFIDENCE_LOW_THRESHOLD"]),
    ("hybrid.context_window_chars", &["IPCODER_HYBRID_CONTEXT_WINDOW_CHARS"]),
    ("hybrid.agreement_confidence_boost", &["IPCODER_HYBRID_AGREEMENT_CONFIDENCE_BOOST"]),
    ("advisor.enabled", &["IPCODER_ADVISOR_ENABLED"]),
    ("advisor.provider", &["IPCODER_ADVISOR_PROVIDER"]),
    ("advisor.model", &["IPCODER_ADVISOR_MODEL"]),
    ("advisor.base_url", &["IPCODER_ADVISOR_BASE_URL"]),
    ("advisor.api_key", &["IPCODER_ADVISOR_API_KEY"]),
    ("advisor.timeout_secs", &["IPCODER_ADVISOR_TIMEOUT_SECS"]),
    ("knowledge.path", &["IPCODER_KNOWLEDGE_PATH"]),
    ("rules.source", &["IPCODER_RULES_SOURCE"]),
    ("rules.declarative_path", &["IPCODER_RULES_DECLARATIVE_PATH"]),
    ("logging.level", &["IPCODER_LOGGING_LEVEL", "IPCODER_LOG_LEVEL"]),
    ("logging.format", &["IPCODER_LOGGING_FORMAT", "IPCODER_LOG_FORMAT"]),
];

#[derive(Debug, Serialize)]
struct ConfigReport {
    values: ConfigView,
    /// key -> `env (VAR)`, `file (path)` or `default`
    sources: BTreeMap<&'static str, String>,
}

pub fn run(global: &GlobalOptions) -> CommandResult {
    let config = match global.load_config(ConfigOverrides::default()) {
        Ok(config) => config,
        Err(error) => return config_failure("config", error),
    };

    let config_file_path = detect_config_path(global.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let sources = FIELDS
        .iter()
        .map(|(key, env_keys)| {
            let source = field_source(
                key,
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            );
            (*key, source)
        })
        .collect();

    CommandResult::success_with_data(
        "config",
        "effective config (source precedence: env > file > default)",
        ConfigReport { values: config.view(), sources },
    )
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("ipcoder.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/ipcoder.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
