use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use ipcoder_cli::commands::code::CodeOptions;
use ipcoder_cli::commands::{code, config, knowledge, GlobalOptions};
use ipcoder_core::hybrid::MergePolicy;
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn code_returns_report_for_evidence_context() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let input = write_file(
            &dir,
            "note.json",
            r#"{
                "note_id": "n-1",
                "text": "Transbronchial biopsy of the right lower lobe.",
                "candidates": [{"code": "31628"}]
            }"#,
        );

        let result = code::run(
            &GlobalOptions::default(),
            CodeOptions { input, policy: Some(MergePolicy::RulesOnly), knowledge_path: None },
        );
        assert_eq!(result.exit_code, 0, "expected successful coding run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "code");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["data"]["note_id"], "n-1");
        assert_eq!(payload["data"]["policy_applied"], "rules_only");
        assert!(payload["data"]["codes"].is_array());
    });
}

#[test]
fn code_accepts_full_coding_request() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let input = write_file(
            &dir,
            "request.json",
            r#"{
                "policy": "rules_only",
                "correlation_id": "req-9",
                "evidence": {
                    "source": "context",
                    "note_id": "n-2",
                    "text": "Diagnostic bronchoscopy."
                }
            }"#,
        );

        let result = code::run(
            &GlobalOptions::default(),
            CodeOptions { input, policy: None, knowledge_path: None },
        );
        assert_eq!(result.exit_code, 0, "expected successful coding run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["correlation_id"], "req-9");
    });
}

#[test]
fn code_returns_input_failure_for_missing_file() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("absent.json");
        let result = code::run(
            &GlobalOptions::default(),
            CodeOptions { input, policy: None, knowledge_path: None },
        );
        assert_eq!(result.exit_code, 3, "expected input failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "invalid_input");
    });
}

#[test]
fn code_returns_config_failure_for_out_of_range_threshold() {
    with_env(&[("IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT", "1.5")], || {
        let dir = TempDir::new().expect("tempdir");
        let input = write_file(&dir, "note.json", r#"{"text": "bronchoscopy"}"#);

        let result = code::run(
            &GlobalOptions::default(),
            CodeOptions { input, policy: None, knowledge_path: None },
        );
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn knowledge_reports_builtin_fingerprint() {
    with_env(&[], || {
        let result = knowledge::run(&GlobalOptions::default(), None);
        assert_eq!(result.exit_code, 0, "expected builtin knowledge to validate");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "knowledge");
        let fingerprint = payload["data"]["fingerprint"].as_str().expect("fingerprint");
        assert!(!fingerprint.is_empty());
        assert!(payload["data"]["codes"].as_u64().unwrap_or_default() > 0);
    });
}

#[test]
fn knowledge_rejects_unparseable_file() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "knowledge.toml", "[codes\nbroken = ");

        let result = knowledge::run(&GlobalOptions::default(), Some(path));
        assert_eq!(result.exit_code, 4, "expected knowledge failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "knowledge_validation");
    });
}

#[test]
fn config_redacts_api_key_and_attributes_sources() {
    with_env(
        &[
            ("IPCODER_ADVISOR_PROVIDER", "openai"),
            ("IPCODER_ADVISOR_API_KEY", "sk-very-secret"),
            ("IPCODER_HYBRID_POLICY", "rules_only"),
        ],
        || {
            let result = config::run(&GlobalOptions::default());
            assert_eq!(result.exit_code, 0, "expected config inspection success");
            assert!(!result.output.contains("sk-very-secret"));

            let payload = parse_payload(&result.output);
            assert_eq!(payload["data"]["values"]["advisor_api_key_configured"], true);
            assert_eq!(payload["data"]["sources"]["hybrid.policy"], "env (IPCODER_HYBRID_POLICY)");
            assert_eq!(payload["data"]["sources"]["advisor.model"], "default");
        },
    );
}

#[test]
fn config_fails_for_missing_explicit_file() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let global = GlobalOptions {
            config_path: Some(dir.path().join("missing.toml")),
            log_level: None,
        };

        let result = config::run(&global);
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
    });
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid json")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "IPCODER_HYBRID_POLICY",
        "IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT",
        "IPCODER_HYBRID_RULE_CONFIDENCE_LOW_THRESHOLD",
        "IPCODER_HYBRID_CONTEXT_WINDOW_CHARS",
        "IPCODER_HYBRID_AGREEMENT_CONFIDENCE_BOOST",
        "IPCODER_ADVISOR_ENABLED",
        "IPCODER_ADVISOR_PROVIDER",
        "IPCODER_ADVISOR_API_KEY",
        "IPCODER_ADVISOR_BASE_URL",
        "IPCODER_ADVISOR_MODEL",
        "IPCODER_ADVISOR_TIMEOUT_SECS",
        "IPCODER_ADVISOR_MAX_SUGGESTIONS",
        "IPCODER_KNOWLEDGE_PATH",
        "IPCODER_RULES_SOURCE",
        "IPCODER_RULES_DECLARATIVE_PATH",
        "IPCODER_LOGGING_LEVEL",
        "IPCODER_LOGGING_FORMAT",
        "IPCODER_LOG_LEVEL",
        "IPCODER_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
