//! Smart-hybrid arbitration between rule output and advisor suggestions.
//!
//! The advisor never overrides the rules silently: advisor-only codes must
//! not have been discarded by a rule, must clear the auto-accept threshold
//! and must be verified against the note text.

pub mod negation;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::advisor::AdvisorSuggestion;
use crate::domain::candidate::CodeCandidate;
use crate::domain::cpt::normalize_code;
use crate::errors::DomainError;
use crate::knowledge::KeywordMap;

use self::negation::{context_window, phrase_pattern, NegationDetector, RegexNegationDetector};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    RulesOnly,
    SmartHybrid,
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RulesOnly => "rules_only",
            Self::SmartHybrid => "smart_hybrid",
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergePolicy {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "rules_only" => Ok(Self::RulesOnly),
            "smart_hybrid" => Ok(Self::SmartHybrid),
            other => Err(DomainError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HybridDecision {
    AcceptedAgreement,
    AcceptedHybrid,
    KeptRulePriority,
    RejectedHybrid,
    DroppedLowConfidence,
    HumanReviewRequired,
}

impl HybridDecision {
    /// Decisions that put the code on the final list.
    pub fn is_retained(&self) -> bool {
        matches!(
            self,
            Self::AcceptedAgreement
                | Self::AcceptedHybrid
                | Self::KeptRulePriority
                | Self::HumanReviewRequired
        )
    }
}

/// One merge decision per code. After the merge, only the explicit
/// `record_*` transitions change it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HybridCandidate {
    code: String,
    decision: HybridDecision,
    confidence: f64,
    rule_confidence: Option<f64>,
    llm_confidence: Option<f64>,
    flags: Vec<String>,
    evidence_verified: bool,
    trigger_phrases: Vec<String>,
}

impl HybridCandidate {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn decision(&self) -> HybridDecision {
        self.decision
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn rule_confidence(&self) -> Option<f64> {
        self.rule_confidence
    }

    pub fn llm_confidence(&self) -> Option<f64> {
        self.llm_confidence
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn evidence_verified(&self) -> bool {
        self.evidence_verified
    }

    pub fn trigger_phrases(&self) -> &[String] {
        &self.trigger_phrases
    }

    /// A family conversion replaced this code after the merge.
    pub fn record_family_conversion(&mut self, to: &str) {
        self.flags.push(format!("hierarchy:{}->{}", self.code, to));
        self.code = to.to_string();
    }

    /// An NCCI edit bundled this code into `into` after the merge.
    pub fn record_bundled(&mut self, into: &str) {
        self.decision = HybridDecision::RejectedHybrid;
        self.flags.push(format!("ncci:bundled_into:{into}"));
    }

    /// A mutually exclusive pair removed this code after the merge.
    pub fn record_excluded(&mut self, winner: &str) {
        self.decision = HybridDecision::RejectedHybrid;
        self.flags.push(format!("exclusive:superseded_by:{winner}"));
    }

    /// The add-on gate removed this code for lack of a primary.
    pub fn record_add_on_dropped(&mut self) {
        self.decision = HybridDecision::RejectedHybrid;
        self.flags.push("addon:no_qualifying_primary".to_string());
    }
}

/// Code to confidence, keeping the highest confidence per code.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoredCodes {
    codes: BTreeMap<String, f64>,
}

pub type RuleResult = ScoredCodes;
pub type AdvisorResult = ScoredCodes;

impl ScoredCodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: &str, confidence: f64) {
        let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        let entry = self.codes.entry(normalize_code(code)).or_insert(confidence);
        if confidence > *entry {
            *entry = confidence;
        }
    }

    pub fn with(mut self, code: &str, confidence: f64) -> Self {
        self.insert(code, confidence);
        self
    }

    pub fn from_candidates(candidates: &[CodeCandidate]) -> Self {
        let mut scored = Self::new();
        for candidate in candidates {
            scored.insert(candidate.code(), candidate.confidence());
        }
        scored
    }

    pub fn from_suggestions(suggestions: &[AdvisorSuggestion]) -> Self {
        let mut scored = Self::new();
        for suggestion in suggestions {
            scored.insert(&suggestion.code, suggestion.confidence);
        }
        scored
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    pub fn confidence(&self, code: &str) -> Option<f64> {
        self.codes.get(code).copied()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.codes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.codes.iter().map(|(code, confidence)| (code.as_str(), *confidence))
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HybridSettings {
    pub advisor_confidence_auto_accept: f64,
    pub rule_confidence_low_threshold: f64,
    pub context_window_chars: usize,
    pub agreement_confidence_boost: f64,
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            advisor_confidence_auto_accept: 0.85,
            rule_confidence_low_threshold: 0.6,
            context_window_chars: 200,
            agreement_confidence_boost: 0.0,
        }
    }
}

pub struct MergeInput<'a> {
    pub rules: &'a RuleResult,
    pub advisor: Option<&'a AdvisorResult>,
    pub text: &'a str,
    pub valid_codes: &'a BTreeSet<String>,
    pub keywords: &'a KeywordMap,
    /// Codes a rule took out of the set, with the rule id.
    pub rule_discards: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default, PartialEq)]
struct Verification {
    verified: bool,
    trigger_phrases: Vec<String>,
    negated_phrases: Vec<String>,
    mapped: bool,
}

pub struct HybridPolicy {
    settings: HybridSettings,
    detector: Box<dyn NegationDetector>,
}

impl Default for HybridPolicy {
    fn default() -> Self {
        Self::new(HybridSettings::default())
    }
}

impl HybridPolicy {
    pub fn new(settings: HybridSettings) -> Self {
        Self::with_detector(settings, Box::new(RegexNegationDetector))
    }

    pub fn with_detector(settings: HybridSettings, detector: Box<dyn NegationDetector>) -> Self {
        Self { settings, detector }
    }

    pub fn settings(&self) -> &HybridSettings {
        &self.settings
    }

    /// String-policy entry point; an unknown policy name is a caller error.
    pub fn merge(
        &self,
        input: MergeInput<'_>,
        policy: &str,
    ) -> Result<Vec<HybridCandidate>, DomainError> {
        let policy = policy.parse::<MergePolicy>()?;
        Ok(self.merge_with(input, policy))
    }

    /// Output is ordered by code. A smart-hybrid merge without advisor
    /// output behaves as rules-only.
    pub fn merge_with(&self, input: MergeInput<'_>, policy: MergePolicy) -> Vec<HybridCandidate> {
        let advisor = match (policy, input.advisor) {
            (MergePolicy::SmartHybrid, Some(advisor)) => advisor,
            _ => return rules_only(input.rules),
        };
        let text = input.text.to_lowercase();
        let mut merged: BTreeMap<String, HybridCandidate> = BTreeMap::new();

        for (code, rule_confidence) in input.rules.iter() {
            let candidate = match advisor.confidence(code) {
                Some(llm_confidence) => HybridCandidate {
                    code: code.to_string(),
                    decision: HybridDecision::AcceptedAgreement,
                    confidence: (rule_confidence.max(llm_confidence)
                        + self.settings.agreement_confidence_boost)
                        .min(1.0),
                    rule_confidence: Some(rule_confidence),
                    llm_confidence: Some(llm_confidence),
                    flags: vec!["agreement".to_string()],
                    evidence_verified: true,
                    trigger_phrases: Vec::new(),
                },
                None if rule_confidence >= self.settings.rule_confidence_low_threshold => {
                    rule_candidate(
                        code,
                        rule_confidence,
                        HybridDecision::KeptRulePriority,
                        "rule_only",
                    )
                }
                None => rule_candidate(
                    code,
                    rule_confidence,
                    HybridDecision::DroppedLowConfidence,
                    "rule_below_low_confidence_threshold",
                ),
            };
            merged.insert(code.to_string(), candidate);
        }

        for (code, llm_confidence) in advisor.iter() {
            if input.rules.contains(code) {
                continue;
            }
            let candidate = if !input.valid_codes.contains(code) {
                advisor_candidate(
                    code,
                    llm_confidence,
                    HybridDecision::RejectedHybrid,
                    "invalid_code_hallucination",
                )
            } else if let Some(rule_id) = input.rule_discards.get(code) {
                advisor_candidate(
                    code,
                    llm_confidence,
                    HybridDecision::RejectedHybrid,
                    &format!("rule_discarded:{rule_id}"),
                )
            } else if llm_confidence < self.settings.advisor_confidence_auto_accept {
                advisor_candidate(
                    code,
                    llm_confidence,
                    HybridDecision::RejectedHybrid,
                    "below_auto_accept_threshold",
                )
            } else {
                let verification = self.verify(code, &text, input.keywords);
                let mut candidate = if verification.verified {
                    advisor_candidate(
                        code,
                        llm_confidence,
                        HybridDecision::AcceptedHybrid,
                        "text_verified",
                    )
                } else {
                    advisor_candidate(
                        code,
                        llm_confidence,
                        HybridDecision::HumanReviewRequired,
                        "high_confidence_unverified",
                    )
                };
                if !verification.mapped {
                    candidate.flags.push("no_keyword_mapping".to_string());
                }
                candidate.flags.extend(
                    verification.negated_phrases.iter().map(|phrase| format!("negated:{phrase}")),
                );
                candidate.evidence_verified = verification.verified;
                candidate.trigger_phrases = verification.trigger_phrases;
                candidate
            };
            merged.insert(code.to_string(), candidate);
        }

        merged.into_values().collect()
    }

    /// The first non-negated positive phrase hit verifies the code.
    fn verify(&self, code: &str, text: &str, keywords: &KeywordMap) -> Verification {
        let Some(phrases) = keywords.get(code).filter(|phrases| !phrases.positive.is_empty()) else {
            return Verification::default();
        };
        let mut verification = Verification { mapped: true, ..Verification::default() };

        for phrase in &phrases.positive {
            let Some(pattern) = phrase_pattern(phrase) else {
                continue;
            };
            for hit in pattern.find_iter(text) {
                let window = context_window(
                    text,
                    hit.start(),
                    hit.end(),
                    self.settings.context_window_chars,
                );
                if self.detector.is_negated(window, &phrases.negative) {
                    if !verification.negated_phrases.contains(phrase) {
                        verification.negated_phrases.push(phrase.clone());
                    }
                    continue;
                }
                verification.verified = true;
                verification.trigger_phrases.push(phrase.clone());
                return verification;
            }
        }
        verification
    }
}

fn rules_only(rules: &RuleResult) -> Vec<HybridCandidate> {
    rules
        .iter()
        .map(|(code, confidence)| {
            rule_candidate(code, confidence, HybridDecision::KeptRulePriority, "rules_only")
        })
        .collect()
}

fn rule_candidate(
    code: &str,
    confidence: f64,
    decision: HybridDecision,
    flag: &str,
) -> HybridCandidate {
    HybridCandidate {
        code: code.to_string(),
        decision,
        confidence,
        rule_confidence: Some(confidence),
        llm_confidence: None,
        flags: vec![flag.to_string()],
        evidence_verified: false,
        trigger_phrases: Vec::new(),
    }
}

fn advisor_candidate(
    code: &str,
    confidence: f64,
    decision: HybridDecision,
    flag: &str,
) -> HybridCandidate {
    HybridCandidate {
        code: code.to_string(),
        decision,
        confidence,
        rule_confidence: None,
        llm_confidence: Some(confidence),
        flags: vec![flag.to_string()],
        evidence_verified: false,
        trigger_phrases: Vec::new(),
    }
}
