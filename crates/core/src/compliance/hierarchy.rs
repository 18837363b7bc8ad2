use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::candidate::CodeCandidate;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyOverrides {
    /// target code -> replacement code
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// family -> dominant code -> overrides applied while the dominant is present
pub type CodeFamilies = BTreeMap<String, BTreeMap<String, FamilyOverrides>>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConversion {
    pub family: String,
    pub dominant: String,
    pub from: String,
    pub to: String,
    /// The replacement was already in the set, so the target was only removed.
    pub deduplicated: bool,
}

impl FamilyConversion {
    pub fn provenance(&self) -> String {
        format!("hierarchy:{}->{}", self.from, self.to)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HierarchyOutcome {
    pub candidates: Vec<CodeCandidate>,
    pub conversions: Vec<FamilyConversion>,
}

pub struct HierarchyNormalizer<'a> {
    families: &'a CodeFamilies,
}

struct PlannedOverride<'a> {
    family: &'a str,
    dominant: &'a str,
    replacement: &'a str,
}

impl<'a> HierarchyNormalizer<'a> {
    pub fn new(families: &'a CodeFamilies) -> Self {
        Self { families }
    }

    /// Rewrites to a fixed point, so running it on its own output is a no-op.
    pub fn apply(&self, candidates: &[CodeCandidate]) -> HierarchyOutcome {
        let mut current = candidates.to_vec();
        let mut conversions = Vec::new();
        let max_passes = self.override_count() + 1;

        for _ in 0..max_passes {
            let next = {
                let present: BTreeSet<&str> = current.iter().map(CodeCandidate::code).collect();
                let plan = self.plan(&present);
                if plan.is_empty() {
                    break;
                }

                let mut emitted = BTreeSet::new();
                let mut next = Vec::with_capacity(current.len());
                for candidate in &current {
                    let Some(planned) = plan.get(candidate.code()) else {
                        next.push(candidate.clone());
                        continue;
                    };

                    let stays_on_its_own = present.contains(planned.replacement)
                        && !plan.contains_key(planned.replacement);
                    let deduplicated = stays_on_its_own || emitted.contains(planned.replacement);
                    let conversion = FamilyConversion {
                        family: planned.family.to_string(),
                        dominant: planned.dominant.to_string(),
                        from: candidate.code().to_string(),
                        to: planned.replacement.to_string(),
                        deduplicated,
                    };
                    if !deduplicated {
                        emitted.insert(planned.replacement);
                        next.push(
                            candidate.superseded_by(planned.replacement, conversion.provenance()),
                        );
                    }
                    conversions.push(conversion);
                }
                next
            };
            current = next;
        }

        HierarchyOutcome { candidates: current, conversions }
    }

    pub fn apply_codes(
        &self,
        codes: &BTreeSet<String>,
    ) -> (BTreeSet<String>, Vec<FamilyConversion>) {
        let candidates: Vec<CodeCandidate> = codes.iter().map(CodeCandidate::new).collect();
        let outcome = self.apply(&candidates);
        let codes =
            outcome.candidates.iter().map(|candidate| candidate.code().to_string()).collect();
        (codes, outcome.conversions)
    }

    fn plan<'p>(&'p self, present: &BTreeSet<&str>) -> BTreeMap<&'p str, PlannedOverride<'p>> {
        let mut plan = BTreeMap::new();
        for (family, dominants) in self.families {
            for (dominant, rule) in dominants {
                if !present.contains(dominant.as_str()) {
                    continue;
                }
                for (target, replacement) in &rule.overrides {
                    if target == dominant || !present.contains(target.as_str()) {
                        continue;
                    }
                    plan.entry(target.as_str()).or_insert(PlannedOverride {
                        family: family.as_str(),
                        dominant: dominant.as_str(),
                        replacement: replacement.as_str(),
                    });
                }
            }
        }
        plan
    }

    fn override_count(&self) -> usize {
        self.families.values().flat_map(BTreeMap::values).map(|rule| rule.overrides.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{CodeFamilies, FamilyOverrides, HierarchyNormalizer};
    use crate::domain::candidate::CodeCandidate;

    fn families() -> CodeFamilies {
        let mut families = CodeFamilies::new();
        families.insert(
            "airway_stent".to_string(),
            BTreeMap::from([(
                "31631".to_string(),
                FamilyOverrides {
                    overrides: BTreeMap::from([("31636".to_string(), "31637".to_string())]),
                },
            )]),
        );
        families.insert(
            "ebus_tbna".to_string(),
            BTreeMap::from([(
                "31653".to_string(),
                FamilyOverrides {
                    overrides: BTreeMap::from([("31652".to_string(), "31653".to_string())]),
                },
            )]),
        );
        families
    }

    fn codes(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn tracheal_base_converts_bronchial_stent_to_additional_stent() {
        let families = families();
        let normalizer = HierarchyNormalizer::new(&families);
        let outcome = normalizer.apply(&[
            CodeCandidate::scored("31631", 0.9, "tracheal stent"),
            CodeCandidate::scored("31636", 0.8, "bronchial stent"),
        ]);

        let converted: Vec<&str> = outcome.candidates.iter().map(CodeCandidate::code).collect();
        assert_eq!(converted, ["31631", "31637"]);
        assert_eq!(outcome.candidates[1].reason(), Some("hierarchy:31636->31637"));
        assert_eq!(outcome.conversions.len(), 1);
        assert!(!outcome.conversions[0].deduplicated);
    }

    #[test]
    fn replacement_already_present_is_not_added_twice() {
        let families = families();
        let (result, conversions) =
            HierarchyNormalizer::new(&families).apply_codes(&codes(&["31652", "31653"]));

        assert_eq!(result, codes(&["31653"]));
        assert!(conversions[0].deduplicated);
    }

    #[test]
    fn untouched_codes_pass_through() {
        let families = families();
        let (result, conversions) =
            HierarchyNormalizer::new(&families).apply_codes(&codes(&["31636", "31628"]));

        assert_eq!(result, codes(&["31636", "31628"]));
        assert!(conversions.is_empty());
    }

    #[test]
    fn normalizing_twice_matches_normalizing_once() {
        let families = families();
        let normalizer = HierarchyNormalizer::new(&families);
        let input = codes(&["31631", "31636", "31652", "31653", "31628"]);

        let (once, _) = normalizer.apply_codes(&input);
        let (twice, second_conversions) = normalizer.apply_codes(&once);

        assert_eq!(once, twice);
        assert!(second_conversions.is_empty());
    }
}
