use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{CodeSet, RuleStep};
use crate::domain::cpt::{is_well_formed, normalize_code};
use crate::domain::evidence::EvidenceContext;
use crate::knowledge::KnowledgeError;

/// A requirement rule: when its code is present and the requirements fail,
/// the code is discarded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarativeRule {
    pub id: String,
    pub code: String,
    pub reason: String,
    #[serde(default)]
    pub require_any_groups: Vec<String>,
    #[serde(default)]
    pub require_any_terms: Vec<String>,
    #[serde(default)]
    pub forbid_terms: Vec<String>,
}

impl DeclarativeRule {
    fn failure(&self, evidence: &EvidenceContext) -> Option<String> {
        if !self.require_any_groups.is_empty()
            && !self.require_any_groups.iter().any(|group| evidence.has_group(group))
        {
            let groups = self.require_any_groups.join("|");
            return Some(format!("{} (needs group: {groups})", self.reason));
        }
        if !self.require_any_terms.is_empty()
            && !self.require_any_terms.iter().any(|category| evidence.has_terms(category))
        {
            let terms = self.require_any_terms.join("|");
            return Some(format!("{} (needs terms: {terms})", self.reason));
        }
        if let Some(category) =
            self.forbid_terms.iter().find(|category| evidence.has_terms(category))
        {
            return Some(format!("{} (forbidden terms: {category})", self.reason));
        }
        None
    }
}

#[derive(Debug, Default, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<DeclarativeRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclarativeRuleSet {
    rules: Vec<DeclarativeRule>,
}

impl DeclarativeRuleSet {
    pub fn from_toml_str(raw: &str) -> Result<Self, KnowledgeError> {
        Self::parse(raw, "inline")
    }

    pub fn load(path: &Path) -> Result<Self, KnowledgeError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| KnowledgeError::ReadFile { path: path.to_path_buf(), source })?;
        Self::parse(&raw, &path.display().to_string())
    }

    fn parse(raw: &str, origin: &str) -> Result<Self, KnowledgeError> {
        let file: RuleFile = toml::from_str(raw)
            .map_err(|source| KnowledgeError::ParseFile { origin: origin.to_string(), source })?;

        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(file.rules.len());
        for mut rule in file.rules {
            rule.id = rule.id.trim().to_string();
            rule.code = normalize_code(&rule.code);
            if rule.id.is_empty() {
                return Err(KnowledgeError::Validation("declarative rule without an id".into()));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(KnowledgeError::Validation(format!(
                    "duplicate declarative rule id {}",
                    rule.id
                )));
            }
            if !is_well_formed(&rule.code) {
                return Err(KnowledgeError::Validation(format!(
                    "declarative rule {} targets malformed code `{}`",
                    rule.id, rule.code
                )));
            }
            for list in
                [&mut rule.require_any_groups, &mut rule.require_any_terms, &mut rule.forbid_terms]
            {
                for item in list.iter_mut() {
                    *item = item.trim().to_ascii_lowercase();
                }
            }
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[DeclarativeRule] {
        &self.rules
    }

    /// One step per rule, each evaluated against the running set.
    pub fn evaluate(&self, evidence: &EvidenceContext, codes: &CodeSet) -> Vec<RuleStep> {
        let mut current = codes.clone();
        let mut steps = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let mut step = RuleStep::begin(rule.id.as_str(), &current);
            if step.has(&rule.code) {
                if let Some(reason) = rule.failure(evidence) {
                    step.discard(&rule.code, reason);
                }
            }
            current = step.codes().clone();
            steps.push(step);
        }
        steps
    }
}
