//! Static coding knowledge: valid codes, fees, NCCI edits, code families,
//! keyword phrases and mutually exclusive pairs.
//!
//! A [`KnowledgeBase`] is a plain immutable value. It is handed to the engine
//! by the caller; the only shared, reloadable holder is [`store::KnowledgeStore`].

pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compliance::exclusive::ExclusivePair;
use crate::compliance::hierarchy::{CodeFamilies, FamilyOverrides};
use crate::compliance::ncci::{ModifierIndicator, NcciEdit};
use crate::domain::cpt::{display_code, has_add_on_marker, is_well_formed, normalize_code};

const BUILTIN_KNOWLEDGE: &str = include_str!("../../data/ip_knowledge.toml");

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("could not read knowledge file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse knowledge file `{origin}`: {source}")]
    ParseFile { origin: String, source: toml::de::Error },
    #[error("knowledge validation failed: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed: Decimal,
    #[serde(default)]
    pub add_on: bool,
    /// Base codes that qualify this add-on. Empty means any base code does.
    #[serde(default)]
    pub primaries: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordPhrases {
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

pub type KeywordMap = BTreeMap<String, KeywordPhrases>;

#[derive(Debug, Default, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    codes: BTreeMap<String, CodeEntry>,
    #[serde(default)]
    ncci: Vec<NcciEdit>,
    #[serde(default)]
    families: CodeFamilies,
    #[serde(default)]
    keywords: KeywordMap,
    #[serde(default)]
    exclusive: Vec<ExclusivePair>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KnowledgeBase {
    codes: BTreeMap<String, CodeEntry>,
    ncci_edits: Vec<NcciEdit>,
    families: CodeFamilies,
    keywords: KeywordMap,
    exclusive_pairs: Vec<ExclusivePair>,
    fingerprint: String,
}

impl KnowledgeBase {
    pub fn builtin() -> Result<Self, KnowledgeError> {
        Self::parse(BUILTIN_KNOWLEDGE, "builtin")
    }

    pub fn load(path: &Path) -> Result<Self, KnowledgeError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| KnowledgeError::ReadFile { path: path.to_path_buf(), source })?;
        Self::parse(&raw, &path.display().to_string())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, KnowledgeError> {
        Self::parse(raw, "inline")
    }

    fn parse(raw: &str, origin: &str) -> Result<Self, KnowledgeError> {
        let file: KnowledgeFile = toml::from_str(raw)
            .map_err(|source| KnowledgeError::ParseFile { origin: origin.to_string(), source })?;

        let codes = file
            .codes
            .into_iter()
            .map(|(raw_code, mut entry)| {
                entry.add_on |= has_add_on_marker(&raw_code);
                entry.primaries = entry.primaries.iter().map(|code| normalize_code(code)).collect();
                (normalize_code(&raw_code), entry)
            })
            .collect();

        let families = file
            .families
            .into_iter()
            .map(|(family, dominants)| {
                let dominants = dominants
                    .into_iter()
                    .map(|(dominant, rule)| {
                        let overrides = rule
                            .overrides
                            .into_iter()
                            .map(|(target, replacement)| {
                                (normalize_code(&target), normalize_code(&replacement))
                            })
                            .collect();
                        (normalize_code(&dominant), FamilyOverrides { overrides })
                    })
                    .collect();
                (family, dominants)
            })
            .collect();

        let keywords = file
            .keywords
            .into_iter()
            .map(|(code, phrases)| {
                let lower = |items: Vec<String>| {
                    items
                        .into_iter()
                        .map(|item| item.trim().to_lowercase())
                        .filter(|item| !item.is_empty())
                        .collect()
                };
                (
                    normalize_code(&code),
                    KeywordPhrases {
                        positive: lower(phrases.positive),
                        negative: lower(phrases.negative),
                    },
                )
            })
            .collect();

        let exclusive_pairs = file
            .exclusive
            .into_iter()
            .map(|pair| {
                ExclusivePair::new(&normalize_code(&pair.winner), &normalize_code(&pair.loser))
            })
            .collect();

        let knowledge = Self {
            codes,
            ncci_edits: file.ncci,
            families,
            keywords,
            exclusive_pairs,
            fingerprint: blake3::hash(raw.as_bytes()).to_hex().to_string(),
        };
        knowledge.validate()?;
        Ok(knowledge)
    }

    pub fn validate(&self) -> Result<(), KnowledgeError> {
        for (code, entry) in &self.codes {
            if !is_well_formed(code) {
                return Err(invalid(format!("code `{code}` is not a well-formed CPT code")));
            }
            if entry.allowed < Decimal::ZERO {
                return Err(invalid(format!("code {code} has a negative allowed amount")));
            }
            for primary in &entry.primaries {
                match self.codes.get(primary) {
                    None => {
                        return Err(invalid(format!(
                            "add-on {code} names unknown primary code {primary}"
                        )))
                    }
                    Some(primary_entry) if primary_entry.add_on => {
                        return Err(invalid(format!(
                            "add-on {code} names add-on {primary} as its primary"
                        )))
                    }
                    Some(_) => {}
                }
            }
            if !entry.primaries.is_empty() && !entry.add_on {
                return Err(invalid(format!("code {code} lists primaries but is not an add-on")));
            }
        }

        for edit in &self.ncci_edits {
            self.require_known(&edit.column1, "ncci edit")?;
            self.require_known(&edit.column2, "ncci edit")?;
            if edit.column1 == edit.column2 {
                return Err(invalid(format!("ncci edit pairs {} with itself", edit.column1)));
            }
        }

        for (family, dominants) in &self.families {
            for (dominant, rule) in dominants {
                self.require_known(dominant, "code family")?;
                for (target, replacement) in &rule.overrides {
                    self.require_known(target, "code family")?;
                    self.require_known(replacement, "code family")?;
                    if target == dominant {
                        return Err(invalid(format!(
                            "family {family} overrides its own dominant code {dominant}"
                        )));
                    }
                }
            }
        }
        if let Some(code) = self.override_cycle() {
            return Err(invalid(format!("code family overrides form a cycle through {code}")));
        }

        for pair in &self.exclusive_pairs {
            self.require_known(&pair.winner, "exclusive pair")?;
            self.require_known(&pair.loser, "exclusive pair")?;
            if pair.winner == pair.loser {
                return Err(invalid(format!("exclusive pair names {} twice", pair.winner)));
            }
        }

        for (code, phrases) in &self.keywords {
            self.require_known(code, "keyword mapping")?;
            if phrases.positive.is_empty() {
                return Err(invalid(format!("keyword mapping for {code} has no positive phrases")));
            }
        }

        Ok(())
    }

    fn require_known(&self, code: &str, context: &str) -> Result<(), KnowledgeError> {
        if self.codes.contains_key(code) {
            Ok(())
        } else {
            Err(invalid(format!("{context} references unknown code {code}")))
        }
    }

    fn override_cycle(&self) -> Option<String> {
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for rule in self.families.values().flat_map(BTreeMap::values) {
            for (target, replacement) in &rule.overrides {
                edges.entry(target.as_str()).or_default().insert(replacement.as_str());
            }
        }

        fn visit<'a>(
            node: &'a str,
            edges: &BTreeMap<&'a str, BTreeSet<&'a str>>,
            visiting: &mut BTreeSet<&'a str>,
            done: &mut BTreeSet<&'a str>,
        ) -> Option<String> {
            if done.contains(node) {
                return None;
            }
            if !visiting.insert(node) {
                return Some(node.to_string());
            }
            for next in edges.get(node).into_iter().flatten() {
                if let Some(cycle) = visit(next, edges, visiting, done) {
                    return Some(cycle);
                }
            }
            visiting.remove(node);
            done.insert(node);
            None
        }

        let mut visiting = BTreeSet::new();
        let mut done = BTreeSet::new();
        edges.keys().find_map(|node| visit(node, &edges, &mut visiting, &mut done))
    }

    pub fn is_valid(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    pub fn valid_codes(&self) -> BTreeSet<String> {
        self.codes.keys().cloned().collect()
    }

    pub fn entry(&self, code: &str) -> Option<&CodeEntry> {
        self.codes.get(code)
    }

    pub fn description(&self, code: &str) -> Option<&str> {
        self.codes.get(code).map(|entry| entry.description.as_str())
    }

    pub fn allowed_amount(&self, code: &str) -> Decimal {
        self.codes.get(code).map(|entry| entry.allowed).unwrap_or(Decimal::ZERO)
    }

    pub fn is_add_on(&self, code: &str) -> bool {
        self.codes.get(code).map(|entry| entry.add_on).unwrap_or(false)
    }

    pub fn add_on_codes(&self) -> BTreeSet<String> {
        self.codes.iter().filter(|(_, entry)| entry.add_on).map(|(code, _)| code.clone()).collect()
    }

    pub fn primaries_for(&self, code: &str) -> &[String] {
        self.codes.get(code).map(|entry| entry.primaries.as_slice()).unwrap_or(&[])
    }

    pub fn display_code(&self, code: &str) -> String {
        display_code(code, self.is_add_on(code))
    }

    pub fn ncci_edits(&self) -> &[NcciEdit] {
        &self.ncci_edits
    }

    pub fn families(&self) -> &CodeFamilies {
        &self.families
    }

    pub fn keywords(&self) -> &KeywordMap {
        &self.keywords
    }

    pub fn exclusive_pairs(&self) -> &[ExclusivePair] {
        &self.exclusive_pairs
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn summary(&self) -> KnowledgeSummary {
        KnowledgeSummary {
            fingerprint: self.fingerprint.clone(),
            codes: self.codes.len(),
            add_on_codes: self.codes.values().filter(|entry| entry.add_on).count(),
            ncci_edits: self.ncci_edits.len(),
            bundling_edits: self
                .ncci_edits
                .iter()
                .filter(|edit| edit.modifier_indicator == ModifierIndicator::NotAllowed)
                .count(),
            families: self.families.len(),
            keyword_codes: self.keywords.len(),
            exclusive_pairs: self.exclusive_pairs.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KnowledgeSummary {
    pub fingerprint: String,
    pub codes: usize,
    pub add_on_codes: usize,
    pub ncci_edits: usize,
    pub bundling_edits: usize,
    pub families: usize,
    pub keyword_codes: usize,
    pub exclusive_pairs: usize,
}

fn invalid(message: String) -> KnowledgeError {
    KnowledgeError::Validation(message)
}
