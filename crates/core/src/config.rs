use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hybrid::{HybridSettings, MergePolicy};
use crate::knowledge::store::KnowledgeSource;
use crate::knowledge::KnowledgeError;
use crate::rules::declarative::DeclarativeRuleSet;
use crate::rules::RuleSource;

#[derive(Clone, Debug)]
pub struct CoderConfig {
    pub hybrid: HybridConfig,
    pub advisor: AdvisorConfig,
    pub knowledge: KnowledgeConfig,
    pub rules: RulesConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct HybridConfig {
    pub policy: MergePolicy,
    pub advisor_confidence_auto_accept: f64,
    pub rule_confidence_low_threshold: f64,
    pub context_window_chars: usize,
    pub agreement_confidence_boost: f64,
}

#[derive(Clone, Debug)]
pub struct AdvisorConfig {
    pub enabled: bool,
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_suggestions: usize,
}

#[derive(Clone, Debug, Default)]
pub struct KnowledgeConfig {
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct RulesConfig {
    pub source: RuleSourceKind,
    pub declarative_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSourceKind {
    #[default]
    Native,
    Declarative,
    Shadow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub policy: Option<MergePolicy>,
    pub log_level: Option<String>,
    pub knowledge_path: Option<PathBuf>,
    pub advisor_enabled: Option<bool>,
    pub rules_source: Option<RuleSourceKind>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for CoderConfig {
    fn default() -> Self {
        let hybrid = HybridSettings::default();
        Self {
            hybrid: HybridConfig {
                policy: MergePolicy::SmartHybrid,
                advisor_confidence_auto_accept: hybrid.advisor_confidence_auto_accept,
                rule_confidence_low_threshold: hybrid.rule_confidence_low_threshold,
                context_window_chars: hybrid.context_window_chars,
                agreement_confidence_boost: hybrid.agreement_confidence_boost,
            },
            advisor: AdvisorConfig {
                enabled: false,
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 20,
                max_suggestions: 12,
            },
            knowledge: KnowledgeConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported advisor provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Anthropic)
    }
}

impl std::str::FromStr for RuleSourceKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "declarative" => Ok(Self::Declarative),
            "shadow" => Ok(Self::Shadow),
            other => Err(ConfigError::Validation(format!(
                "unsupported rules source `{other}` (expected native|declarative|shadow)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl HybridConfig {
    pub fn settings(&self) -> HybridSettings {
        HybridSettings {
            advisor_confidence_auto_accept: self.advisor_confidence_auto_accept,
            rule_confidence_low_threshold: self.rule_confidence_low_threshold,
            context_window_chars: self.context_window_chars,
            agreement_confidence_boost: self.agreement_confidence_boost,
        }
    }
}

impl AdvisorConfig {
    /// Remote providers need an api key, local ones a base url. Missing
    /// credentials disable the advisor at runtime rather than failing config.
    pub fn has_credentials(&self) -> bool {
        if self.provider.requires_api_key() {
            self.api_key.as_ref().map(|key| !key.expose_secret().trim().is_empty()).unwrap_or(false)
        } else {
            self.base_url.as_ref().map(|url| !url.trim().is_empty()).unwrap_or(false)
        }
    }
}

impl KnowledgeConfig {
    pub fn source(&self) -> KnowledgeSource {
        KnowledgeSource::from_path(self.path.clone())
    }
}

impl RulesConfig {
    pub fn rule_source(&self) -> Result<RuleSource, KnowledgeError> {
        let load = |path: &Option<PathBuf>| match path {
            Some(path) => DeclarativeRuleSet::load(path),
            None => Err(KnowledgeError::Validation(
                "rules.declarative_path is required for declarative and shadow sources".to_string(),
            )),
        };
        Ok(match self.source {
            RuleSourceKind::Native => RuleSource::Native,
            RuleSourceKind::Declarative => RuleSource::Declarative(load(&self.declarative_path)?),
            RuleSourceKind::Shadow => RuleSource::Shadow(load(&self.declarative_path)?),
        })
    }
}

/// Printable configuration with secrets reduced to presence flags.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigView {
    pub policy: MergePolicy,
    pub advisor_confidence_auto_accept: f64,
    pub rule_confidence_low_threshold: f64,
    pub context_window_chars: usize,
    pub agreement_confidence_boost: f64,
    pub advisor_enabled: bool,
    pub advisor_provider: LlmProvider,
    pub advisor_model: String,
    pub advisor_base_url: Option<String>,
    pub advisor_api_key_configured: bool,
    pub advisor_timeout_secs: u64,
    pub knowledge_path: Option<String>,
    pub rules_source: RuleSourceKind,
    pub rules_declarative_path: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl CoderConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("ipcoder.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(hybrid) = patch.hybrid {
            if let Some(policy) = hybrid.policy {
                self.hybrid.policy = policy;
            }
            if let Some(value) = hybrid.advisor_confidence_auto_accept {
                self.hybrid.advisor_confidence_auto_accept = value;
            }
            if let Some(value) = hybrid.rule_confidence_low_threshold {
                self.hybrid.rule_confidence_low_threshold = value;
            }
            if let Some(value) = hybrid.context_window_chars {
                self.hybrid.context_window_chars = value;
            }
            if let Some(value) = hybrid.agreement_confidence_boost {
                self.hybrid.agreement_confidence_boost = value;
            }
        }

        if let Some(advisor) = patch.advisor {
            if let Some(enabled) = advisor.enabled {
                self.advisor.enabled = enabled;
            }
            if let Some(provider) = advisor.provider {
                self.advisor.provider = provider;
            }
            if let Some(advisor_api_key_value) = advisor.api_key {
                self.advisor.api_key = Some(secret_value(advisor_api_key_value));
            }
            if let Some(base_url) = advisor.base_url {
                self.advisor.base_url = Some(base_url);
            }
            if let Some(model) = advisor.model {
                self.advisor.model = model;
            }
            if let Some(timeout_secs) = advisor.timeout_secs {
                self.advisor.timeout_secs = timeout_secs;
            }
            if let Some(max_suggestions) = advisor.max_suggestions {
                self.advisor.max_suggestions = max_suggestions;
            }
        }

        if let Some(knowledge) = patch.knowledge {
            if let Some(path) = knowledge.path {
                self.knowledge.path = Some(path);
            }
        }

        if let Some(rules) = patch.rules {
            if let Some(source) = rules.source {
                self.rules.source = source;
            }
            if let Some(path) = rules.declarative_path {
                self.rules.declarative_path = Some(path);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("IPCODER_HYBRID_POLICY") {
            self.hybrid.policy = value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "IPCODER_HYBRID_POLICY".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = read_env("IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT") {
            self.hybrid.advisor_confidence_auto_accept =
                parse_f64("IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT", &value)?;
        }
        if let Some(value) = read_env("IPCODER_HYBRID_RULE_CONFIDENCE_LOW_THRESHOLD") {
            self.hybrid.rule_confidence_low_threshold =
                parse_f64("IPCODER_HYBRID_RULE_CONFIDENCE_LOW_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("IPCODER_HYBRID_CONTEXT_WINDOW_CHARS") {
            self.hybrid.context_window_chars =
                parse_usize("IPCODER_HYBRID_CONTEXT_WINDOW_CHARS", &value)?;
        }
        if let Some(value) = read_env("IPCODER_HYBRID_AGREEMENT_CONFIDENCE_BOOST") {
            self.hybrid.agreement_confidence_boost =
                parse_f64("IPCODER_HYBRID_AGREEMENT_CONFIDENCE_BOOST", &value)?;
        }

        if let Some(value) = read_env("IPCODER_ADVISOR_ENABLED") {
            self.advisor.enabled = parse_bool("IPCODER_ADVISOR_ENABLED", &value)?;
        }
        if let Some(value) = read_env("IPCODER_ADVISOR_PROVIDER") {
            self.advisor.provider = value.parse()?;
        }
        if let Some(value) = read_env("IPCODER_ADVISOR_API_KEY") {
            self.advisor.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("IPCODER_ADVISOR_BASE_URL") {
            self.advisor.base_url = Some(value);
        }
        if let Some(value) = read_env("IPCODER_ADVISOR_MODEL") {
            self.advisor.model = value;
        }
        if let Some(value) = read_env("IPCODER_ADVISOR_TIMEOUT_SECS") {
            self.advisor.timeout_secs = parse_u64("IPCODER_ADVISOR_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("IPCODER_ADVISOR_MAX_SUGGESTIONS") {
            self.advisor.max_suggestions = parse_usize("IPCODER_ADVISOR_MAX_SUGGESTIONS", &value)?;
        }

        if let Some(value) = read_env("IPCODER_KNOWLEDGE_PATH") {
            self.knowledge.path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("IPCODER_RULES_SOURCE") {
            self.rules.source = value.parse()?;
        }
        if let Some(value) = read_env("IPCODER_RULES_DECLARATIVE_PATH") {
            self.rules.declarative_path = Some(PathBuf::from(value));
        }

        let log_level = read_env("IPCODER_LOGGING_LEVEL").or_else(|| read_env("IPCODER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("IPCODER_LOGGING_FORMAT").or_else(|| read_env("IPCODER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(policy) = overrides.policy {
            self.hybrid.policy = policy;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(path) = overrides.knowledge_path {
            self.knowledge.path = Some(path);
        }
        if let Some(enabled) = overrides.advisor_enabled {
            self.advisor.enabled = enabled;
        }
        if let Some(source) = overrides.rules_source {
            self.rules.source = source;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_hybrid(&self.hybrid)?;
        validate_advisor(&self.advisor)?;
        validate_rules(&self.rules)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    pub fn view(&self) -> ConfigView {
        ConfigView {
            policy: self.hybrid.policy,
            advisor_confidence_auto_accept: self.hybrid.advisor_confidence_auto_accept,
            rule_confidence_low_threshold: self.hybrid.rule_confidence_low_threshold,
            context_window_chars: self.hybrid.context_window_chars,
            agreement_confidence_boost: self.hybrid.agreement_confidence_boost,
            advisor_enabled: self.advisor.enabled,
            advisor_provider: self.advisor.provider,
            advisor_model: self.advisor.model.clone(),
            advisor_base_url: self.advisor.base_url.clone(),
            advisor_api_key_configured: self
                .advisor
                .api_key
                .as_ref()
                .map(|key| !key.expose_secret().trim().is_empty())
                .unwrap_or(false),
            advisor_timeout_secs: self.advisor.timeout_secs,
            knowledge_path: self.knowledge.path.as_ref().map(|path| path.display().to_string()),
            rules_source: self.rules.source,
            rules_declarative_path: self
                .rules
                .declarative_path
                .as_ref()
                .map(|path| path.display().to_string()),
            log_level: self.logging.level.clone(),
            log_format: self.logging.format,
        }
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("ipcoder.toml"), PathBuf::from("config/ipcoder.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_hybrid(hybrid: &HybridConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("hybrid.advisor_confidence_auto_accept", hybrid.advisor_confidence_auto_accept),
        ("hybrid.rule_confidence_low_threshold", hybrid.rule_confidence_low_threshold),
        ("hybrid.agreement_confidence_boost", hybrid.agreement_confidence_boost),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!("{name} must be in range 0.0..=1.0")));
        }
    }

    if hybrid.context_window_chars == 0 || hybrid.context_window_chars > 5000 {
        return Err(ConfigError::Validation(
            "hybrid.context_window_chars must be in range 1..=5000".to_string(),
        ));
    }

    Ok(())
}

fn validate_advisor(advisor: &AdvisorConfig) -> Result<(), ConfigError> {
    if advisor.timeout_secs == 0 || advisor.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "advisor.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if advisor.max_suggestions == 0 {
        return Err(ConfigError::Validation(
            "advisor.max_suggestions must be greater than zero".to_string(),
        ));
    }

    if advisor.model.trim().is_empty() {
        return Err(ConfigError::Validation("advisor.model must not be empty".to_string()));
    }

    if let Some(base_url) = &advisor.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "advisor.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_rules(rules: &RulesConfig) -> Result<(), ConfigError> {
    if rules.source != RuleSourceKind::Native && rules.declarative_path.is_none() {
        return Err(ConfigError::Validation(
            "rules.declarative_path is required when rules.source is declarative or shadow"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    hybrid: Option<HybridPatch>,
    advisor: Option<AdvisorPatch>,
    knowledge: Option<KnowledgePatch>,
    rules: Option<RulesPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct HybridPatch {
    policy: Option<MergePolicy>,
    advisor_confidence_auto_accept: Option<f64>,
    rule_confidence_low_threshold: Option<f64>,
    context_window_chars: Option<usize>,
    agreement_confidence_boost: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct AdvisorPatch {
    enabled: Option<bool>,
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_suggestions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct KnowledgePatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RulesPatch {
    source: Option<RuleSourceKind>,
    declarative_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        CoderConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat,
        RuleSourceKind,
    };
    use crate::hybrid::MergePolicy;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_thresholds() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let config = CoderConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        let hybrid = &config.hybrid;
        ensure(hybrid.policy == MergePolicy::SmartHybrid, "default policy is smart_hybrid")?;
        ensure(hybrid.advisor_confidence_auto_accept == 0.85, "auto-accept defaults to 0.85")?;
        ensure(hybrid.rule_confidence_low_threshold == 0.6, "low threshold defaults to 0.6")?;
        ensure(config.hybrid.context_window_chars == 200, "window defaults to 200")?;
        ensure(!config.advisor.enabled, "advisor is opt-in")?;
        ensure(config.rules.source == RuleSourceKind::Native, "native rules by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_IPCODER_ADVISOR_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("ipcoder.toml");
            fs::write(
                &path,
                r#"
[advisor]
enabled = true
provider = "openai"
api_key = "${TEST_IPCODER_ADVISOR_KEY}"
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                CoderConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.advisor.provider == LlmProvider::OpenAi,
                "provider should come from file",
            )?;
            ensure(
                config
                    .advisor
                    .api_key
                    .as_ref()
                    .is_some_and(|key| key.expose_secret() == "sk-from-env"),
                "api key should be interpolated from environment",
            )?;
            ensure(config.advisor.has_credentials(), "interpolated key counts as credentials")
        })();

        clear_vars(&["TEST_IPCODER_ADVISOR_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("IPCODER_HYBRID_RULE_CONFIDENCE_LOW_THRESHOLD", "0.5");
        env::set_var("IPCODER_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("ipcoder.toml");
            fs::write(
                &path,
                r#"
[hybrid]
policy = "smart_hybrid"
rule_confidence_low_threshold = 0.7
context_window_chars = 120

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = CoderConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    policy: Some(MergePolicy::RulesOnly),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.hybrid.policy == MergePolicy::RulesOnly, "override policy should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.hybrid.rule_confidence_low_threshold == 0.5, "env threshold beats file")?;
            ensure(config.hybrid.context_window_chars == 120, "file window beats default")?;
            ensure(matches!(config.logging.format, LogFormat::Json), "env log format alias applies")
        })();

        clear_vars(&["IPCODER_HYBRID_RULE_CONFIDENCE_LOW_THRESHOLD", "IPCODER_LOG_FORMAT"]);
        result
    }

    #[test]
    fn out_of_range_threshold_fails_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT", "1.5");

        let result = (|| -> Result<(), String> {
            let error = match CoderConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("advisor_confidence_auto_accept")
            );
            ensure(has_message, "validation failure should name the threshold")
        })();

        clear_vars(&["IPCODER_HYBRID_ADVISOR_CONFIDENCE_AUTO_ACCEPT"]);
        result
    }

    #[test]
    fn unknown_policy_in_env_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("IPCODER_HYBRID_POLICY", "llm_only");
        let result = match CoderConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) if key == "IPCODER_HYBRID_POLICY" => {
                Ok(())
            }
            other => Err(format!("expected invalid env override, got {other:?}")),
        };

        clear_vars(&["IPCODER_HYBRID_POLICY"]);
        result
    }

    #[test]
    fn enabled_remote_advisor_without_key_still_loads() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("IPCODER_ADVISOR_ENABLED", "true");
        env::set_var("IPCODER_ADVISOR_PROVIDER", "anthropic");

        let result = (|| -> Result<(), String> {
            let config = CoderConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.advisor.enabled, "advisor stays enabled")?;
            ensure(!config.advisor.has_credentials(), "missing key is reported as no credentials")
        })();

        clear_vars(&["IPCODER_ADVISOR_ENABLED", "IPCODER_ADVISOR_PROVIDER"]);
        result
    }

    #[test]
    fn declarative_source_requires_a_rule_file() {
        let config = CoderConfig {
            rules: super::RulesConfig { source: RuleSourceKind::Shadow, declarative_path: None },
            ..CoderConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug_or_view() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("IPCODER_ADVISOR_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = CoderConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");
            let view = serde_json::to_string(&config.view()).map_err(|err| err.to_string())?;

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(!view.contains("sk-secret-value"), "view should not contain api key")?;
            ensure(config.view().advisor_api_key_configured, "view reports key presence")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["IPCODER_ADVISOR_API_KEY"]);
        result
    }
}
