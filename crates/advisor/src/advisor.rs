use std::fmt::Write as _;

use async_trait::async_trait;
use ipcoder_core::advisor::{AdvisorError, AdvisorSuggestion, CodeAdvisor};
use ipcoder_core::knowledge::KnowledgeBase;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::guardrails::AdvisorGuardrails;
use crate::llm::LlmClient;

/// Code advisor backed by a language model. The prompt lists the codes the
/// knowledge base knows; replies are parsed leniently and then passed through
/// the guardrails.
pub struct LlmCodeAdvisor<C> {
    client: C,
    name: String,
    catalog: String,
    guardrails: AdvisorGuardrails,
    fence: Regex,
}

impl<C: LlmClient> LlmCodeAdvisor<C> {
    pub fn new(
        client: C,
        name: impl Into<String>,
        knowledge: &KnowledgeBase,
        guardrails: AdvisorGuardrails,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            client,
            name: name.into(),
            catalog: code_catalog(knowledge),
            guardrails,
            fence: Regex::new(r"(?s)```(?:json)?\s*(.*?)```")?,
        })
    }

    pub fn prompt(&self, text: &str) -> String {
        format!(
            "Assign CPT codes to the procedure note below. Use only codes from this list:\n{}\n\
             Reply with a JSON array such as \
             [{{\"code\": \"31628\", \"confidence\": 0.9, \"rationale\": \"...\"}}]. \
             Confidence is between 0 and 1. Return [] when nothing is billable.\n\n\
             Procedure note:\n{}",
            self.catalog,
            text.trim()
        )
    }

    pub fn parse_reply(&self, reply: &str) -> Result<Vec<AdvisorSuggestion>, AdvisorError> {
        let body = self
            .fence
            .captures(reply)
            .and_then(|captures| captures.get(1))
            .map_or(reply, |inner| inner.as_str());
        let array = first_json_array(body)
            .ok_or_else(|| AdvisorError::MalformedOutput("reply contains no JSON array".into()))?;
        let items: Vec<Value> = serde_json::from_str(array).map_err(|error| {
            AdvisorError::MalformedOutput(format!("invalid JSON array: {error}"))
        })?;

        Ok(items.iter().filter_map(suggestion_from_value).collect())
    }
}

#[async_trait]
impl<C: LlmClient> CodeAdvisor for LlmCodeAdvisor<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn suggest_codes(&self, text: &str) -> Result<Vec<AdvisorSuggestion>, AdvisorError> {
        let reply = self
            .client
            .complete(&self.prompt(text))
            .await
            .map_err(|error| AdvisorError::Transport(format!("{error:#}")))?;
        let outcome = self.guardrails.apply(self.parse_reply(&reply)?);

        for rejection in &outcome.rejected {
            warn!(
                event_name = "advisor.guardrail.rejected",
                advisor = %self.name,
                code = %rejection.code,
                reason_code = rejection.reason_code,
                "advisor suggestion rejected by guardrails"
            );
        }
        debug!(
            event_name = "advisor.suggestions.parsed",
            advisor = %self.name,
            accepted = outcome.suggestions.len(),
            rejected = outcome.rejected.len(),
            "advisor reply parsed"
        );
        Ok(outcome.suggestions)
    }
}

fn code_catalog(knowledge: &KnowledgeBase) -> String {
    let mut catalog = String::new();
    for code in knowledge.valid_codes() {
        let description = knowledge.description(&code).unwrap_or_default();
        let _ = writeln!(catalog, "- {}: {}", knowledge.display_code(&code), description);
    }
    catalog
}

/// Slice of the first balanced `[...]` in `text`, skipping brackets inside
/// JSON strings.
fn first_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn suggestion_from_value(value: &Value) -> Option<AdvisorSuggestion> {
    let code = match &value["code"] {
        Value::String(code) => code.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    let confidence = match &value["confidence"] {
        Value::Number(number) => number.as_f64().unwrap_or_default(),
        Value::String(raw) => raw.trim().parse::<f64>().unwrap_or_default(),
        _ => 0.0,
    };
    let rationale = value["rationale"].as_str().unwrap_or_default().to_string();
    Some(AdvisorSuggestion::new(code, confidence, rationale))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use ipcoder_core::advisor::{AdvisorError, CodeAdvisor};
    use ipcoder_core::knowledge::KnowledgeBase;

    use super::{first_json_array, LlmCodeAdvisor};
    use crate::guardrails::AdvisorGuardrails;
    use crate::llm::LlmClient;

    #[derive(Clone, Default)]
    struct FakeClient {
        reply: String,
        fail: bool,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LlmClient for FakeClient {
        async fn complete(&self, prompt: &str) -> Result<String> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            if self.fail {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.reply.clone())
        }
    }

    fn advisor(client: FakeClient) -> LlmCodeAdvisor<FakeClient> {
        let knowledge = KnowledgeBase::builtin().expect("builtin knowledge");
        LlmCodeAdvisor::new(client, "fake", &knowledge, AdvisorGuardrails::default())
            .expect("advisor")
    }

    #[tokio::test]
    async fn fenced_reply_with_prose_is_parsed() {
        let client = FakeClient {
            reply: "Here are the codes:\n```json\n\
                    [{\"code\": \"31628\", \"confidence\": 0.92, \"rationale\": \"TBLB [RLL]\"},\n\
                    {\"code\": 31624, \"confidence\": \"0.7\"}]\n```\nLet me know."
                .to_string(),
            ..FakeClient::default()
        };
        let prompts = client.prompts.clone();

        let suggestions = advisor(client)
            .suggest_codes("TBLB of the RLL, BAL of the RML")
            .await
            .expect("suggestions");

        let codes: Vec<(&str, f64)> =
            suggestions.iter().map(|s| (s.code.as_str(), s.confidence)).collect();
        assert_eq!(codes, vec![("31628", 0.92), ("31624", 0.7)]);
        assert_eq!(suggestions[0].rationale, "TBLB [RLL]");

        let prompt = prompts.lock().expect("prompts").first().cloned().unwrap_or_default();
        assert!(prompt.contains("+31654"), "catalog marks add-on codes");
        assert!(prompt.ends_with("TBLB of the RLL, BAL of the RML"));
    }

    #[tokio::test]
    async fn reply_without_array_is_malformed() {
        let client =
            FakeClient { reply: "I cannot code this note.".into(), ..FakeClient::default() };
        let error = advisor(client).suggest_codes("note").await.expect_err("malformed");
        assert!(matches!(error, AdvisorError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn client_failure_is_a_transport_error() {
        let client = FakeClient { fail: true, ..FakeClient::default() };
        let error = advisor(client).suggest_codes("note").await.expect_err("transport");
        assert!(matches!(
            error,
            AdvisorError::Transport(ref message) if message.contains("connection refused")
        ));
    }

    #[test]
    fn array_scan_ignores_brackets_inside_strings() {
        let text = r#"note: [{"code": "31628", "rationale": "see ] here"}] trailing [1]"#;
        let expected = r#"[{"code": "31628", "rationale": "see ] here"}]"#;
        assert_eq!(first_json_array(text), Some(expected));
        assert_eq!(first_json_array("no array"), None);
    }
}
