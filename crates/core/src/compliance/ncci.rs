use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::cpt::normalize_code;

/// NCCI PTP modifier indicator: `0` never overridable, `1` overridable with a
/// distinct-site modifier, `9` edit not applicable (deleted).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifierIndicator {
    #[serde(rename = "0")]
    NotAllowed,
    #[serde(rename = "1")]
    Allowed,
    #[serde(rename = "9")]
    NotApplicable,
}

impl FromStr for ModifierIndicator {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "0" => Ok(Self::NotAllowed),
            "1" => Ok(Self::Allowed),
            "9" => Ok(Self::NotApplicable),
            other => Err(format!("unsupported NCCI modifier indicator `{other}` (expected 0|1|9)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNcciEdit")]
pub struct NcciEdit {
    pub column1: String,
    pub column2: String,
    pub modifier_indicator: ModifierIndicator,
}

impl NcciEdit {
    pub fn new(column1: &str, column2: &str, modifier_indicator: ModifierIndicator) -> Self {
        Self {
            column1: normalize_code(column1),
            column2: normalize_code(column2),
            modifier_indicator,
        }
    }
}

/// Accepts both the indicator form and the older boolean `modifier_allowed`.
#[derive(Deserialize)]
struct RawNcciEdit {
    column1: String,
    column2: String,
    #[serde(default)]
    modifier_indicator: Option<String>,
    #[serde(default)]
    modifier_allowed: Option<bool>,
}

impl TryFrom<RawNcciEdit> for NcciEdit {
    type Error = String;

    fn try_from(raw: RawNcciEdit) -> Result<Self, Self::Error> {
        let modifier_indicator = match (raw.modifier_indicator, raw.modifier_allowed) {
            (Some(indicator), _) => indicator.parse()?,
            (None, Some(true)) => ModifierIndicator::Allowed,
            (None, Some(false)) => ModifierIndicator::NotAllowed,
            (None, None) => {
                return Err(format!(
                    "NCCI edit {}/{} needs modifier_indicator or modifier_allowed",
                    raw.column1, raw.column2
                ))
            }
        };
        Ok(Self::new(&raw.column1, &raw.column2, modifier_indicator))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcciPair {
    pub column1: String,
    pub column2: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcciResult {
    pub allowed: BTreeSet<String>,
    /// `bundled[column2] = column1`
    pub bundled: BTreeMap<String, String>,
    /// Indicator-1 pairs that both survived; column2 needs a distinct-site
    /// modifier confirmed by a reviewer before both can be billed.
    pub modifier_eligible: Vec<NcciPair>,
}

impl NcciResult {
    pub fn needs_distinct_site_modifier(&self, code: &str) -> bool {
        self.modifier_eligible.iter().any(|pair| pair.column2 == code)
    }
}

pub struct NcciGatekeeper<'a> {
    edits: &'a [NcciEdit],
}

impl<'a> NcciGatekeeper<'a> {
    pub fn new(edits: &'a [NcciEdit]) -> Self {
        Self { edits }
    }

    /// Edits are applied in configured order against the working set, so a
    /// column1 code already bundled away no longer bundles anything.
    pub fn apply(&self, codes: &BTreeSet<String>) -> NcciResult {
        let mut allowed = codes.clone();
        let mut bundled = BTreeMap::new();

        for edit in self.edits {
            if edit.modifier_indicator != ModifierIndicator::NotAllowed {
                continue;
            }
            if allowed.contains(&edit.column1) && allowed.remove(&edit.column2) {
                bundled.insert(edit.column2.clone(), edit.column1.clone());
            }
        }

        let modifier_eligible = self
            .edits
            .iter()
            .filter(|edit| edit.modifier_indicator == ModifierIndicator::Allowed)
            .filter(|edit| allowed.contains(&edit.column1) && allowed.contains(&edit.column2))
            .map(|edit| NcciPair { column1: edit.column1.clone(), column2: edit.column2.clone() })
            .collect();

        NcciResult { allowed, bundled, modifier_eligible }
    }
}
