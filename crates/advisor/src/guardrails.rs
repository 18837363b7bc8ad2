use std::collections::BTreeMap;

use ipcoder_core::advisor::AdvisorSuggestion;
use ipcoder_core::domain::cpt::{is_well_formed, normalize_code};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailRejection {
    pub code: String,
    pub reason_code: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GuardrailOutcome {
    pub suggestions: Vec<AdvisorSuggestion>,
    pub rejected: Vec<GuardrailRejection>,
}

/// Structural checks on advisor output. Whether a well-formed code is known
/// to the knowledge base is left to the hybrid merge, which reports it as a
/// hallucination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvisorGuardrails {
    pub max_suggestions: usize,
}

impl Default for AdvisorGuardrails {
    fn default() -> Self {
        Self { max_suggestions: 12 }
    }
}

impl AdvisorGuardrails {
    pub fn new(max_suggestions: usize) -> Self {
        Self { max_suggestions }
    }

    pub fn apply(&self, raw: Vec<AdvisorSuggestion>) -> GuardrailOutcome {
        let mut rejected = Vec::new();
        let mut best: BTreeMap<String, AdvisorSuggestion> = BTreeMap::new();

        for suggestion in raw {
            let code = normalize_code(&suggestion.code);
            if !is_well_formed(&code) {
                rejected.push(GuardrailRejection {
                    code: suggestion.code,
                    reason_code: "malformed_code",
                });
                continue;
            }
            let confidence = if suggestion.confidence.is_finite() {
                suggestion.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            let candidate = AdvisorSuggestion::new(code.clone(), confidence, suggestion.rationale);

            match best.get(&code) {
                Some(existing) if existing.confidence >= confidence => {
                    rejected.push(GuardrailRejection { code, reason_code: "duplicate_code" });
                }
                Some(_) => {
                    rejected.push(GuardrailRejection {
                        code: code.clone(),
                        reason_code: "duplicate_code",
                    });
                    best.insert(code, candidate);
                }
                None => {
                    best.insert(code, candidate);
                }
            }
        }

        let mut suggestions: Vec<AdvisorSuggestion> = best.into_values().collect();
        suggestions.sort_by(|left, right| {
            right.confidence.total_cmp(&left.confidence).then_with(|| left.code.cmp(&right.code))
        });
        if suggestions.len() > self.max_suggestions {
            for dropped in suggestions.split_off(self.max_suggestions) {
                rejected.push(GuardrailRejection {
                    code: dropped.code,
                    reason_code: "over_suggestion_cap",
                });
            }
        }

        GuardrailOutcome { suggestions, rejected }
    }
}
