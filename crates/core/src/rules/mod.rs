//! Deterministic rule engine.
//!
//! Each rule cluster is a pure function from the running code set and the
//! evidence to a [`RuleStep`]: the cluster's successor code set plus the trace
//! entries that explain every change. The engine folds the clusters left to
//! right.

pub mod clusters;
pub mod declarative;
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::candidate::CodeCandidate;
use crate::domain::evidence::EvidenceContext;
use crate::errors::DomainError;
use crate::knowledge::KnowledgeBase;

use self::declarative::DeclarativeRuleSet;

pub type CodeSet = BTreeSet<String>;

/// Confidence given to a code a rule added or rewrote.
pub const RULE_DERIVED_CONFIDENCE: f64 = 0.9;
/// Confidence given to an unscored input candidate that survived every rule.
pub const DEFAULT_RULE_CONFIDENCE: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Add,
    Discard,
    Upgrade,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub rule_id: String,
    pub action: RuleAction,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    pub reason: String,
}

impl TraceEntry {
    /// The code this entry leaves in the set, if any.
    pub fn resulting_code(&self) -> Option<&str> {
        match self.action {
            RuleAction::Add => Some(self.code.as_str()),
            RuleAction::Upgrade => self.replacement.as_deref(),
            RuleAction::Discard => None,
        }
    }

    /// The code this entry takes out of the set, if any.
    pub fn removed_code(&self) -> Option<&str> {
        match self.action {
            RuleAction::Discard | RuleAction::Upgrade => Some(self.code.as_str()),
            RuleAction::Add => None,
        }
    }
}

pub struct RuleContext<'a> {
    pub evidence: &'a EvidenceContext,
    pub knowledge: &'a KnowledgeBase,
}

/// Working copy for one cluster. Every mutation records a trace entry; no-op
/// mutations record nothing.
pub struct RuleStep {
    rule_id: String,
    codes: CodeSet,
    trace: Vec<TraceEntry>,
    warnings: Vec<String>,
}

impl RuleStep {
    pub fn begin(rule_id: impl Into<String>, codes: &CodeSet) -> Self {
        Self {
            rule_id: rule_id.into(),
            codes: codes.clone(),
            trace: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn has(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn has_any(&self, codes: &[&str]) -> bool {
        codes.iter().any(|code| self.codes.contains(*code))
    }

    pub fn codes(&self) -> &CodeSet {
        &self.codes
    }

    pub fn discard(&mut self, code: &str, reason: impl Into<String>) -> bool {
        if !self.codes.remove(code) {
            return false;
        }
        self.record(RuleAction::Discard, code, None, reason.into());
        true
    }

    pub fn discard_all(&mut self, codes: &[&str], reason: &str) {
        for code in codes {
            self.discard(code, reason);
        }
    }

    pub fn add(&mut self, code: &str, reason: impl Into<String>) -> bool {
        if !self.codes.insert(code.to_string()) {
            return false;
        }
        self.record(RuleAction::Add, code, None, reason.into());
        true
    }

    /// Replaces `from` with `to`. When `to` is already present the upgrade
    /// only removes `from`.
    pub fn upgrade(&mut self, from: &str, to: &str, reason: impl Into<String>) -> bool {
        if from == to || !self.codes.remove(from) {
            return false;
        }
        self.codes.insert(to.to_string());
        self.record(RuleAction::Upgrade, from, Some(to.to_string()), reason.into());
        true
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn record(
        &mut self,
        action: RuleAction,
        code: &str,
        replacement: Option<String>,
        reason: String,
    ) {
        self.trace.push(TraceEntry {
            rule_id: self.rule_id.clone(),
            action,
            code: code.to_string(),
            replacement,
            reason,
        });
    }
}

pub type RuleFn = fn(&RuleContext<'_>, &CodeSet) -> RuleStep;

#[derive(Clone, Copy)]
pub struct NativeRule {
    pub id: &'static str,
    pub name: &'static str,
    pub apply: RuleFn,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowDiff {
    pub native_only: CodeSet,
    pub declarative_only: CodeSet,
}

impl ShadowDiff {
    pub fn is_empty(&self) -> bool {
        self.native_only.is_empty() && self.declarative_only.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesResult {
    pub codes: CodeSet,
    pub trace: Vec<TraceEntry>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_diff: Option<ShadowDiff>,
}

impl RulesResult {
    pub fn seeded(codes: CodeSet) -> Self {
        Self { codes, ..Self::default() }
    }

    pub fn apply(&mut self, step: RuleStep) {
        self.codes = step.codes;
        self.trace.extend(step.trace);
        self.warnings.extend(step.warnings);
    }

    /// Codes whose most recent trace entry took them out of the set.
    pub fn active_discards(&self) -> CodeSet {
        self.discarded_by().into_keys().collect()
    }

    /// Each actively discarded code with the id of the rule that removed it.
    pub fn discarded_by(&self) -> BTreeMap<String, String> {
        let mut last: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for entry in &self.trace {
            if let Some(code) = entry.removed_code() {
                last.insert(code, Some(entry.rule_id.as_str()));
            }
            if let Some(code) = entry.resulting_code() {
                last.insert(code, None);
            }
        }
        last.into_iter()
            .filter_map(|(code, rule_id)| {
                rule_id.map(|rule_id| (code.to_string(), rule_id.to_string()))
            })
            .collect()
    }

    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if let Some(code) = self.active_discards().intersection(&self.codes).next() {
            return Err(DomainError::InvariantViolation(format!(
                "code {code} survived rule evaluation with an active discard"
            )));
        }
        Ok(())
    }

    /// The trace entry that last put `code` into the set, if a rule did.
    pub fn origin(&self, code: &str) -> Option<&TraceEntry> {
        self.trace.iter().rev().find(|entry| entry.resulting_code() == Some(code))
    }

    /// Scores the surviving codes. Rule-derived codes get
    /// [`RULE_DERIVED_CONFIDENCE`], scored input candidates keep their score,
    /// other survivors get [`DEFAULT_RULE_CONFIDENCE`].
    pub fn to_candidates(&self, evidence: &EvidenceContext) -> Vec<CodeCandidate> {
        self.codes
            .iter()
            .map(|code| {
                if let Some(origin) = self.origin(code) {
                    let reason = format!("{}: {}", origin.rule_id, origin.reason);
                    let source = match origin.action {
                        RuleAction::Upgrade => evidence.candidate(&origin.code),
                        _ => evidence.candidate(code),
                    };
                    return match source {
                        Some(candidate) => candidate
                            .superseded_by(code, reason)
                            .rescored(RULE_DERIVED_CONFIDENCE),
                        None => CodeCandidate::scored(code, RULE_DERIVED_CONFIDENCE, reason),
                    };
                }
                match evidence.candidate(code) {
                    Some(candidate) if candidate.is_scored() => candidate.clone(),
                    Some(candidate) => candidate
                        .superseded_by(code, candidate.reason().unwrap_or("documented candidate"))
                        .rescored(DEFAULT_RULE_CONFIDENCE),
                    None => {
                        CodeCandidate::scored(code, DEFAULT_RULE_CONFIDENCE, "documented candidate")
                    }
                }
            })
            .collect()
    }
}

/// Where rule logic comes from, fixed at engine construction.
#[derive(Clone, Debug, Default)]
pub enum RuleSource {
    #[default]
    Native,
    Declarative(DeclarativeRuleSet),
    /// Native is authoritative; the declarative set runs alongside and
    /// differences are reported.
    Shadow(DeclarativeRuleSet),
}

impl RuleSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Declarative(_) => "declarative",
            Self::Shadow(_) => "shadow",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleEngine {
    source: RuleSource,
}

impl RuleEngine {
    pub fn new(source: RuleSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &RuleSource {
        &self.source
    }

    pub fn evaluate(&self, evidence: &EvidenceContext, knowledge: &KnowledgeBase) -> RulesResult {
        let context = RuleContext { evidence, knowledge };
        let seed = evidence.candidate_codes();

        let result = match &self.source {
            RuleSource::Native => run_native(&context, &seed),
            RuleSource::Declarative(rules) => run_declarative(rules, &context, &seed),
            RuleSource::Shadow(rules) => {
                let mut native = run_native(&context, &seed);
                let shadow = run_declarative(rules, &context, &seed);
                let diff = ShadowDiff {
                    native_only: native.codes.difference(&shadow.codes).cloned().collect(),
                    declarative_only: shadow.codes.difference(&native.codes).cloned().collect(),
                };
                if !diff.is_empty() {
                    warn!(
                        event_name = "coding.rules.shadow_mismatch",
                        note_id = evidence.note_id().unwrap_or("-"),
                        native_only = ?diff.native_only,
                        declarative_only = ?diff.declarative_only,
                        "declarative rules disagree with native rules"
                    );
                }
                native.shadow_diff = Some(diff);
                native
            }
        };

        debug!(
            event_name = "coding.rules.evaluated",
            note_id = evidence.note_id().unwrap_or("-"),
            source = self.source.label(),
            input_codes = seed.len(),
            output_codes = result.codes.len(),
            trace_entries = result.trace.len(),
            "rule evaluation finished"
        );
        result
    }
}

fn run_native(context: &RuleContext<'_>, seed: &CodeSet) -> RulesResult {
    let mut result = RulesResult::seeded(seed.clone());
    for rule in clusters::native_rules() {
        let step = (rule.apply)(context, &result.codes);
        result.apply(step);
    }
    result.apply(clusters::out_of_domain(context, &result.codes));
    result
}

fn run_declarative(
    rules: &DeclarativeRuleSet,
    context: &RuleContext<'_>,
    seed: &CodeSet,
) -> RulesResult {
    let mut result = RulesResult::seeded(seed.clone());
    result.apply(clusters::out_of_domain(context, &result.codes));
    for step in rules.evaluate(context.evidence, &result.codes) {
        result.apply(step);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{RuleAction, RuleStep, RulesResult, TraceEntry};
    use crate::domain::candidate::CodeCandidate;
    use crate::domain::evidence::{EvidenceContext, EvidenceInput};

    fn codes(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn step_records_only_effective_changes() {
        let mut step = RuleStep::begin("R999", &codes(&["31629"]));
        assert!(!step.discard("31624", "not present"));
        assert!(step.upgrade("31629", "31652", "linear EBUS"));
        assert!(!step.add("31652", "already there"));

        let mut result = RulesResult::default();
        result.apply(step);
        assert_eq!(result.codes, codes(&["31652"]));
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace[0].action, RuleAction::Upgrade);
    }

    #[test]
    fn re_added_code_has_no_active_discard() {
        let mut result = RulesResult::seeded(codes(&["31652"]));
        let mut first = RuleStep::begin("R002", &result.codes);
        first.discard("31652", "radial only");
        result.apply(first);
        let mut second = RuleStep::begin("R003", &result.codes);
        second.add("31652", "stations documented");
        result.apply(second);

        assert!(result.active_discards().is_empty());
        assert!(result.check_invariants().is_ok());
    }

    #[test]
    fn discards_name_the_rule_that_removed_the_code() {
        let mut result = RulesResult::seeded(codes(&["31624", "31629"]));
        let mut step = RuleStep::begin("R007", &result.codes);
        step.discard("31624", "washings only");
        result.apply(step);
        let mut step = RuleStep::begin("R002", &result.codes);
        step.upgrade("31629", "31652", "linear EBUS documented");
        result.apply(step);

        let discarded = result.discarded_by();
        assert_eq!(discarded.get("31624").map(String::as_str), Some("R007"));
        assert_eq!(discarded.get("31629").map(String::as_str), Some("R002"));
        assert!(!discarded.contains_key("31652"));
    }

    #[test]
    fn surviving_code_with_active_discard_is_an_invariant_violation() {
        let result = RulesResult {
            codes: codes(&["31624"]),
            trace: vec![TraceEntry {
                rule_id: "R007".to_string(),
                action: RuleAction::Discard,
                code: "31624".to_string(),
                replacement: None,
                reason: "washings only".to_string(),
            }],
            ..RulesResult::default()
        };
        assert!(result.check_invariants().is_err());
    }

    #[test]
    fn candidates_are_scored_by_origin() {
        let evidence = EvidenceContext::build(EvidenceInput {
            candidates: vec![
                CodeCandidate::scored("31628", 0.72, "tblb mentioned"),
                CodeCandidate::new("31624"),
                CodeCandidate::scored("31629", 0.5, "tbna mentioned"),
            ],
            ..EvidenceInput::default()
        })
        .expect("evidence");

        let mut result = RulesResult::seeded(codes(&["31628", "31624", "31629"]));
        let mut step = RuleStep::begin("R002", &result.codes);
        step.upgrade("31629", "31652", "linear EBUS documented");
        result.apply(step);

        let scored = result.to_candidates(&evidence);
        let by_code = |code: &str| {
            scored.iter().find(|candidate| candidate.code() == code).expect("candidate present")
        };
        assert_eq!(by_code("31628").confidence(), 0.72);
        assert_eq!(by_code("31624").confidence(), super::DEFAULT_RULE_CONFIDENCE);
        assert_eq!(by_code("31652").confidence(), super::RULE_DERIVED_CONFIDENCE);
        assert_eq!(by_code("31652").reason(), Some("R002: linear EBUS documented"));
    }
}
