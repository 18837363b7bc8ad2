use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::candidate::CodeCandidate;
use crate::errors::DomainError;

pub type EvidenceDetail = Map<String, Value>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationContext {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub target_reached: Option<bool>,
    #[serde(default)]
    pub tool_in_lesion: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RadialContext {
    #[serde(default)]
    pub performed: bool,
    #[serde(default)]
    pub view: Option<String>,
}

/// Wire shape of the upstream extractor output for one note.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceInput {
    #[serde(default)]
    pub note_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub evidence: BTreeMap<String, EvidenceDetail>,
    #[serde(default)]
    pub registry: BTreeMap<String, Value>,
    #[serde(default)]
    pub term_hits: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub navigation: NavigationContext,
    #[serde(default)]
    pub radial: RadialContext,
    #[serde(default)]
    pub candidates: Vec<CodeCandidate>,
}

/// Read-only view of everything documented in one procedure note.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvidenceContext {
    note_id: Option<String>,
    groups: BTreeSet<String>,
    evidence: BTreeMap<String, EvidenceDetail>,
    registry: BTreeMap<String, Value>,
    term_hits: BTreeMap<String, Vec<String>>,
    navigation: NavigationContext,
    radial: RadialContext,
    text_lower: String,
    candidates: Vec<CodeCandidate>,
}

impl EvidenceContext {
    pub fn build(input: EvidenceInput) -> Result<Self, DomainError> {
        let mut groups = BTreeSet::new();
        for group in input.groups {
            let group = group.trim().to_ascii_lowercase();
            if group.is_empty() {
                return Err(DomainError::InvalidEvidence("group names must not be empty".into()));
            }
            groups.insert(group);
        }

        let mut term_hits: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (category, hits) in input.term_hits {
            let category = category.trim().to_ascii_lowercase();
            if category.is_empty() {
                return Err(DomainError::InvalidEvidence(
                    "term hit categories must not be empty".into(),
                ));
            }
            let hits = hits
                .into_iter()
                .map(|hit| hit.trim().to_lowercase())
                .filter(|hit| !hit.is_empty());
            term_hits.entry(category).or_default().extend(hits);
        }
        term_hits.retain(|_, hits| !hits.is_empty());

        let mut evidence = BTreeMap::new();
        for (group, detail) in input.evidence {
            evidence.insert(group.trim().to_ascii_lowercase(), detail);
        }

        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();
        for candidate in input.candidates {
            if candidate.code().is_empty() {
                return Err(DomainError::InvalidEvidence("candidate code must not be empty".into()));
            }
            if seen.insert(candidate.code().to_string()) {
                candidates.push(candidate);
            }
        }

        Ok(Self {
            note_id: input.note_id,
            groups,
            evidence,
            registry: input.registry,
            term_hits,
            navigation: input.navigation,
            radial: input.radial,
            text_lower: input.text.to_lowercase(),
            candidates,
        })
    }

    pub fn note_id(&self) -> Option<&str> {
        self.note_id.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text_lower
    }

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    pub fn has_group_containing(&self, fragment: &str) -> bool {
        self.groups.iter().any(|group| group.contains(fragment))
    }

    pub fn terms(&self, category: &str) -> &[String] {
        self.term_hits.get(category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_terms(&self, category: &str) -> bool {
        !self.terms(category).is_empty()
    }

    pub fn detail(&self, group: &str, key: &str) -> Option<&Value> {
        self.evidence.get(group).and_then(|detail| detail.get(key))
    }

    pub fn registry_value(&self, key: &str) -> Option<&Value> {
        self.registry.get(key)
    }

    pub fn registry_flag(&self, key: &str) -> bool {
        matches!(self.registry.get(key), Some(Value::Bool(true)))
    }

    pub fn navigation(&self) -> &NavigationContext {
        &self.navigation
    }

    pub fn radial(&self) -> &RadialContext {
        &self.radial
    }

    pub fn candidates(&self) -> &[CodeCandidate] {
        &self.candidates
    }

    pub fn candidate(&self, code: &str) -> Option<&CodeCandidate> {
        self.candidates.iter().find(|candidate| candidate.code() == code)
    }

    pub fn candidate_codes(&self) -> BTreeSet<String> {
        self.candidates.iter().map(|candidate| candidate.code().to_string()).collect()
    }

    /// Unique lymph-node stations sampled by linear EBUS. Explicit station
    /// lists win over bare counts; `None` means no station context at all.
    pub fn ebus_station_count(&self) -> Option<usize> {
        let mut stations = BTreeSet::new();
        for value in [
            self.detail("bronchoscopy_ebus_linear", "stations"),
            self.registry_value("ebus_stations"),
        ]
        .into_iter()
        .flatten()
        {
            stations.extend(string_items(value).map(|station| station.to_ascii_uppercase()));
        }
        if !stations.is_empty() {
            return Some(stations.len());
        }

        [
            self.detail("bronchoscopy_ebus_linear", "station_count"),
            self.registry_value("ebus_station_count"),
        ]
        .into_iter()
        .flatten()
        .find_map(Value::as_u64)
        .map(|count| count as usize)
    }

    /// Distinct lobes recorded for a procedure group, merged with the
    /// registry mirror of the same list.
    pub fn lobes(&self, group: &str, registry_key: &str) -> BTreeSet<String> {
        [self.detail(group, "lobes"), self.registry_value(registry_key)]
            .into_iter()
            .flatten()
            .flat_map(string_items)
            .map(|lobe| lobe.to_ascii_uppercase())
            .collect()
    }

    pub fn location(&self, group: &str) -> Option<String> {
        self.detail(group, "location")
            .and_then(Value::as_str)
            .map(|location| location.trim().to_lowercase())
            .filter(|location| !location.is_empty())
    }
}

fn string_items(value: &Value) -> impl Iterator<Item = String> + '_ {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EvidenceContext, EvidenceInput};
    use crate::domain::candidate::CodeCandidate;
    use crate::errors::DomainError;

    fn input_with(value: serde_json::Value) -> EvidenceInput {
        serde_json::from_value(value).expect("fixture should deserialize")
    }

    #[test]
    fn build_normalizes_groups_terms_and_text() {
        let context = EvidenceContext::build(input_with(json!({
            "text": "Linear EBUS performed. Stations 4R, 7 and 11L sampled.",
            "groups": [" Bronchoscopy_EBUS_Linear "],
            "term_hits": { "Stent": [" Stent ", ""] }
        })))
        .expect("context should build");

        assert!(context.has_group("bronchoscopy_ebus_linear"));
        assert!(context.text().contains("linear ebus performed"));
        assert_eq!(context.terms("stent"), ["stent".to_string()]);
    }

    #[test]
    fn station_list_is_deduplicated_across_sources() {
        let context = EvidenceContext::build(input_with(json!({
            "evidence": { "bronchoscopy_ebus_linear": { "stations": ["4R", "7", "4r"] } },
            "registry": { "ebus_stations": ["11L", "7"] }
        })))
        .expect("context should build");

        assert_eq!(context.ebus_station_count(), Some(3));
    }

    #[test]
    fn station_count_falls_back_to_numeric_field() {
        let context = EvidenceContext::build(input_with(json!({
            "registry": { "ebus_station_count": 2 }
        })))
        .expect("context should build");
        assert_eq!(context.ebus_station_count(), Some(2));

        let empty = EvidenceContext::build(EvidenceInput::default()).expect("context should build");
        assert_eq!(empty.ebus_station_count(), None);
    }

    #[test]
    fn duplicate_candidates_keep_first_occurrence() {
        let context = EvidenceContext::build(EvidenceInput {
            candidates: vec![
                CodeCandidate::scored("31628", 0.9, "first"),
                CodeCandidate::scored("31628", 0.2, "second"),
            ],
            ..EvidenceInput::default()
        })
        .expect("context should build");

        assert_eq!(context.candidates().len(), 1);
        assert_eq!(context.candidate("31628").and_then(|c| c.reason()), Some("first"));
    }

    #[test]
    fn empty_group_name_is_a_contract_violation() {
        let error = EvidenceContext::build(input_with(json!({ "groups": ["  "] })))
            .expect_err("empty group should be rejected");
        assert!(matches!(error, DomainError::InvalidEvidence(_)));
    }
}
