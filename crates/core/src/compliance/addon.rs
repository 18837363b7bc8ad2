use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::knowledge::KnowledgeBase;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnDrop {
    pub code: String,
    pub reason: String,
}

/// Drops add-on codes that have no qualifying base code left in the set.
/// An add-on with configured primaries needs one of them; otherwise any base
/// code qualifies.
pub fn gate_add_ons(
    codes: &BTreeSet<String>,
    knowledge: &KnowledgeBase,
) -> (BTreeSet<String>, Vec<AddOnDrop>) {
    let base_codes: BTreeSet<&String> =
        codes.iter().filter(|code| !knowledge.is_add_on(code)).collect();

    let mut kept = BTreeSet::new();
    let mut dropped = Vec::new();
    for code in codes {
        if !knowledge.is_add_on(code) {
            kept.insert(code.clone());
            continue;
        }

        let primaries = knowledge.primaries_for(code);
        let qualified = if primaries.is_empty() {
            !base_codes.is_empty()
        } else {
            primaries.iter().any(|primary| base_codes.contains(primary))
        };

        if qualified {
            kept.insert(code.clone());
        } else {
            let reason = if primaries.is_empty() {
                format!("add-on {code} has no base code in the final set")
            } else {
                format!("add-on {code} requires one of {} in the final set", primaries.join(", "))
            };
            dropped.push(AddOnDrop { code: code.clone(), reason });
        }
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::gate_add_ons;
    use crate::knowledge::KnowledgeBase;

    fn codes(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn add_ons_alone_are_all_dropped() {
        let knowledge = KnowledgeBase::builtin().expect("builtin knowledge");
        let (kept, dropped) = gate_add_ons(&codes(&["31627", "31654", "31632"]), &knowledge);

        assert!(kept.is_empty());
        assert_eq!(dropped.len(), 3);
    }

    #[test]
    fn add_on_needs_its_own_primary() {
        let knowledge = KnowledgeBase::builtin().expect("builtin knowledge");
        let (kept, dropped) = gate_add_ons(&codes(&["31625", "31632", "31654"]), &knowledge);

        assert_eq!(kept, codes(&["31625", "31654"]));
        assert_eq!(dropped[0].code, "31632");
        assert!(dropped[0].reason.contains("31628"));
    }
}
